use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use taskmesh_config::RedisConfig;
use taskmesh_errors::{TaskMeshError, TaskMeshResult};

/// Shared Redis connection handle.
///
/// Commands go through a multiplexed [`ConnectionManager`] that reconnects
/// on its own; the initial connection is retried here so a node can start
/// before Redis finishes coming up. Pub/sub needs a dedicated connection
/// per subscription, handed out by [`RedisConnection::pubsub`].
#[derive(Clone)]
pub struct RedisConnection {
    client: Client,
    manager: ConnectionManager,
}

impl RedisConnection {
    pub async fn connect(config: &RedisConfig) -> TaskMeshResult<Self> {
        let redis_url = config.build_connection_url();
        let client = Client::open(redis_url).map_err(|e| {
            TaskMeshError::transport(format!("failed to create Redis client: {e}"))
        })?;

        let manager = Self::connect_with_retry(&client, config).await?;

        let connection = Self { client, manager };
        connection.ping().await?;
        debug!(
            host = %config.host,
            port = config.port,
            "connected to Redis"
        );

        Ok(connection)
    }

    async fn connect_with_retry(
        client: &Client,
        config: &RedisConfig,
    ) -> TaskMeshResult<ConnectionManager> {
        let connect_timeout = Duration::from_secs(config.connection_timeout_seconds);
        let mut last_error = None;

        for attempt in 0..config.max_retry_attempts {
            match timeout(connect_timeout, client.get_connection_manager()).await {
                Ok(Ok(manager)) => {
                    if attempt > 0 {
                        debug!("connected to Redis after {} attempts", attempt + 1);
                    }
                    return Ok(manager);
                }
                Ok(Err(e)) => last_error = Some(e.to_string()),
                Err(_) => {
                    last_error = Some(format!(
                        "connection attempt timed out after {connect_timeout:?}"
                    ))
                }
            }

            if attempt < config.max_retry_attempts - 1 {
                warn!(
                    "failed to connect to Redis (attempt {}/{}): {}. Retrying in {}s",
                    attempt + 1,
                    config.max_retry_attempts,
                    last_error.as_deref().unwrap_or("unknown"),
                    config.retry_delay_seconds
                );
                sleep(Duration::from_secs(config.retry_delay_seconds)).await;
            }
        }

        let error_msg = format!(
            "failed to connect to Redis after {} attempts. Last error: {}",
            config.max_retry_attempts,
            last_error.unwrap_or_else(|| "unknown".to_string())
        );
        error!("{}", error_msg);
        Err(TaskMeshError::transport(error_msg))
    }

    /// Run one command on the multiplexed connection.
    pub async fn execute<T: redis::FromRedisValue>(
        &self,
        cmd: &redis::Cmd,
    ) -> TaskMeshResult<T> {
        let mut conn = self.manager.clone();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| TaskMeshError::transport(format!("Redis command failed: {e}")))
    }

    /// Open a dedicated pub/sub connection.
    pub async fn pubsub(&self) -> TaskMeshResult<redis::aio::PubSub> {
        self.client.get_async_pubsub().await.map_err(|e| {
            TaskMeshError::transport(format!("failed to open Redis pub/sub connection: {e}"))
        })
    }

    pub async fn ping(&self) -> TaskMeshResult<()> {
        let response: String = self.execute(&redis::cmd("PING")).await?;
        if response == "PONG" {
            Ok(())
        } else {
            let error_msg = format!("unexpected PING response: {response}");
            error!("{}", error_msg);
            Err(TaskMeshError::transport(error_msg))
        }
    }
}
