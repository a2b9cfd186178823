//! Republishing raw job records onto a message queue.
//!
//! Publishing is fire-and-forget. A connection is opened once per run and
//! dropped when the run ends; any transport failure is fatal for the run.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::api::Job;
use crate::config::{QueueConfig, QueueMode};
use crate::log::*;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("queue is not configured: missing `{0}`")]
    NotConfigured(&'static str),
    #[error("failed connecting to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("failed publishing to {destination}: {source}")]
    Publish {
        destination: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("failed serializing job {job}: {source}")]
    Serialize {
        job: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Opens connections to the queue.
#[async_trait]
pub trait Publisher: fmt::Debug + Send + Sync {
    async fn connect(&self) -> Result<Box<dyn QueueConnection>, TransportError>;
}

/// An open connection bound to one destination.
#[async_trait]
pub trait QueueConnection: fmt::Debug + Send {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError>;
}

/// Publish the raw record of `job` on `connection`.
#[tracing::instrument(skip(connection, job), fields(job = job.id()))]
pub async fn publish_job(
    connection: &mut dyn QueueConnection,
    job: &Job,
) -> Result<(), TransportError> {
    let payload = job
        .to_json_bytes()
        .map_err(|source| TransportError::Serialize {
            job: job.id().to_string(),
            source,
        })?;
    connection.publish(&payload).await?;
    debug!("published job {} ({} bytes)", job.id(), payload.len());
    Ok(())
}

/// Redis-backed publisher. `channel` mode uses PUBLISH, `list` mode RPUSH.
#[derive(Debug, Clone)]
pub struct RedisPublisher {
    url: String,
    destination: String,
    mode: QueueMode,
}

impl RedisPublisher {
    pub fn new(config: &QueueConfig) -> Result<Self, TransportError> {
        let url = config
            .url()
            .clone()
            .ok_or(TransportError::NotConfigured("queue.url"))?;
        let destination = config
            .destination()
            .clone()
            .ok_or(TransportError::NotConfigured("queue.destination"))?;
        Ok(Self {
            url,
            destination,
            mode: *config.mode(),
        })
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    #[tracing::instrument(skip(self), fields(destination = %self.destination))]
    async fn connect(&self) -> Result<Box<dyn QueueConnection>, TransportError> {
        let connect_err = |source| TransportError::Connect {
            url: self.url.clone(),
            source,
        };
        let client = redis::Client::open(self.url.as_str()).map_err(connect_err)?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(connect_err)?;
        info!("connected to queue at {}", self.url);
        Ok(Box::new(RedisConnection {
            connection,
            destination: self.destination.clone(),
            mode: self.mode,
        }))
    }
}

struct RedisConnection {
    connection: redis::aio::MultiplexedConnection,
    destination: String,
    mode: QueueMode,
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnection")
            .field("destination", &self.destination)
            .field("mode", &self.mode)
            .finish()
    }
}

#[async_trait]
impl QueueConnection for RedisConnection {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let command = match self.mode {
            QueueMode::Channel => "PUBLISH",
            QueueMode::List => "RPUSH",
        };
        let _: i64 = redis::cmd(command)
            .arg(&self.destination)
            .arg(payload)
            .query_async(&mut self.connection)
            .await
            .map_err(|source| TransportError::Publish {
                destination: self.destination.clone(),
                source,
            })?;
        Ok(())
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        debug!("closing queue connection for {}", self.destination);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory publisher for exercising the run loop without a broker.

    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, Default)]
    pub(crate) struct MemoryPublisher {
        pub(crate) published: Arc<Mutex<Vec<Vec<u8>>>>,
        pub(crate) connections: Arc<Mutex<usize>>,
        pub(crate) refuse_connections: bool,
        /// Fail every publish after this many have succeeded.
        pub(crate) fail_after: Option<usize>,
    }

    impl MemoryPublisher {
        pub(crate) fn messages(&self) -> Vec<serde_json::Value> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|bytes| serde_json::from_slice(bytes).unwrap())
                .collect()
        }

        pub(crate) fn connection_count(&self) -> usize {
            *self.connections.lock().unwrap()
        }
    }

    #[derive(Debug)]
    struct MemoryConnection {
        publisher: MemoryPublisher,
    }

    #[async_trait]
    impl Publisher for MemoryPublisher {
        async fn connect(&self) -> Result<Box<dyn QueueConnection>, TransportError> {
            if self.refuse_connections {
                return Err(TransportError::Connect {
                    url: "memory://".into(),
                    source: redis::RedisError::from((
                        redis::ErrorKind::IoError,
                        "connection refused",
                    )),
                });
            }
            *self.connections.lock().unwrap() += 1;
            Ok(Box::new(MemoryConnection {
                publisher: self.clone(),
            }))
        }
    }

    #[async_trait]
    impl QueueConnection for MemoryConnection {
        async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError> {
            let mut published = self.publisher.published.lock().unwrap();
            if let Some(limit) = self.publisher.fail_after {
                if published.len() >= limit {
                    return Err(TransportError::Publish {
                        destination: "memory".into(),
                        source: redis::RedisError::from((
                            redis::ErrorKind::IoError,
                            "broken pipe",
                        )),
                    });
                }
            }
            published.push(payload.to_vec());
            Ok(())
        }
    }
}
