//! PostgreSQL backend over `sqlx::PgPool`.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};

use super::{BackendKind, PoolBackend, PoolLimits};
use crate::descriptor::{ConnectionDescriptor, SslMode};
use crate::error::BoxError;

/// Opens `PgPool`s sized by [`PoolLimits`].
#[derive(Clone, Debug, Default)]
pub struct Postgres {
    limits: PoolLimits,
}

impl Postgres {
    pub fn new(limits: PoolLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }
}

fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
    }
}

/// Translate a descriptor into driver options. `.pgpass` is never read and
/// every descriptor field overrides its `PG*` environment default.
pub(crate) fn connect_options(descriptor: &ConnectionDescriptor) -> PgConnectOptions {
    PgConnectOptions::new_without_pgpass()
        .host(&descriptor.host)
        .port(descriptor.port)
        .database(&descriptor.database)
        .username(&descriptor.user)
        .password(descriptor.password.expose())
        .ssl_mode(ssl_mode(descriptor.ssl_mode))
}

impl PoolBackend for Postgres {
    type Handle = PgPool;

    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<PgPool, BoxError> {
        let pool = PgPoolOptions::new()
            .min_connections(self.limits.min_connections)
            .max_connections(self.limits.max_connections)
            .max_lifetime(self.limits.max_lifetime)
            .idle_timeout(self.limits.idle_timeout)
            .acquire_timeout(self.limits.acquire_timeout)
            .connect_with(connect_options(descriptor))
            .await?;

        tracing::debug!(
            host = %descriptor.host,
            port = descriptor.port,
            database = %descriptor.database,
            sslmode = %descriptor.ssl_mode,
            max_connections = self.limits.max_connections,
            "opened postgres pool"
        );
        Ok(pool)
    }

    async fn close(&self, handle: PgPool) -> Result<(), BoxError> {
        handle.close().await;
        Ok(())
    }
}
