//! MySQL backend over `sqlx::MySqlPool`.

use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};

use super::{BackendKind, PoolBackend, PoolLimits};
use crate::descriptor::{ConnectionDescriptor, SslMode};
use crate::error::BoxError;

/// Opens `MySqlPool`s sized by [`PoolLimits`].
#[derive(Clone, Debug)]
pub struct MySql {
    limits: PoolLimits,
}

impl MySql {
    pub fn new(limits: PoolLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }
}

impl Default for MySql {
    fn default() -> Self {
        Self::new(PoolLimits::mysql())
    }
}

fn ssl_mode(mode: SslMode) -> MySqlSslMode {
    match mode {
        SslMode::Disable => MySqlSslMode::Disabled,
        SslMode::Prefer => MySqlSslMode::Preferred,
        SslMode::Require => MySqlSslMode::Required,
    }
}

pub(crate) fn connect_options(descriptor: &ConnectionDescriptor) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&descriptor.host)
        .port(descriptor.port)
        .database(&descriptor.database)
        .username(&descriptor.user)
        .password(descriptor.password.expose())
        .ssl_mode(ssl_mode(descriptor.ssl_mode))
}

impl PoolBackend for MySql {
    type Handle = MySqlPool;

    fn kind(&self) -> BackendKind {
        BackendKind::MySql
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<MySqlPool, BoxError> {
        let pool = MySqlPoolOptions::new()
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
            ssl_mode = descriptor.ssl_mode.as_mysql(),
            max_connections = self.limits.max_connections,
            "opened mysql pool"
        );
        Ok(pool)
    }

    async fn close(&self, handle: MySqlPool) -> Result<(), BoxError> {
        handle.close().await;
        Ok(())
    }
}
