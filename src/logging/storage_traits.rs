use std::future::Future;
use std::pin::Pin;

use crate::logging::types::RequestLog;
use crate::logging::DatabaseLogger;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// 日志落盘抽象（默认 SQLite，可替换）
pub trait RequestLogStore: Send + Sync {
    fn insert_request_log<'a>(&'a self, log: &'a RequestLog) -> BoxFuture<'a, rusqlite::Result<i64>>;
}

// 密钥持久化抽象：仅承载组织验证标记的单调提升
pub trait KeyStore: Send + Sync {
    fn update_organization_status<'a>(
        &'a self,
        key_id: i64,
        is_organization: bool,
    ) -> BoxFuture<'a, rusqlite::Result<()>>;
}

impl RequestLogStore for DatabaseLogger {
    fn insert_request_log<'a>(&'a self, log: &'a RequestLog) -> BoxFuture<'a, rusqlite::Result<i64>> {
        Box::pin(async move { self.insert_request_log(log).await })
    }
}

impl KeyStore for DatabaseLogger {
    fn update_organization_status<'a>(
        &'a self,
        key_id: i64,
        is_organization: bool,
    ) -> BoxFuture<'a, rusqlite::Result<()>> {
        Box::pin(async move { self.update_organization_status(key_id, is_organization).await })
    }
}
