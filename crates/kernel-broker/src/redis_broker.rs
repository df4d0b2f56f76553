//! Redis-backed `Broker`. Uses `LPUSH`/`BRPOP` against one or more
//! `host:port` servers — connect-time failover across the list, no
//! reconnection logic beyond that (a connection drop is a fatal broker
//! error per §4.1, not something this adapter recovers from).

use std::time::Duration;

use log::warn;
use redis::Commands;

use crate::{Broker, BrokerError, RawMessage};

pub struct RedisBroker {
    conn: redis::Connection,
}

impl RedisBroker {
    /// Connects to the first reachable `host:port` in `servers`.
    pub fn connect(servers: &[String]) -> Result<Self, BrokerError> {
        let mut last_err = None;
        for server in servers {
            let url = format!("redis://{server}");
            match redis::Client::open(url.clone()).and_then(|c| c.get_connection()) {
                Ok(conn) => return Ok(Self { conn }),
                Err(e) => {
                    warn!("failed to connect to broker server {server}: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(BrokerError::Connect(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "no broker_servers configured".to_string()),
        ))
    }
}

impl Broker for RedisBroker {
    fn get_messages(&mut self, queue: &str, timeout: Duration) -> Result<Vec<RawMessage>, BrokerError> {
        let timeout_secs = timeout.as_secs_f64().max(0.0);
        let reply: Option<(String, String)> = self
            .conn
            .brpop(queue, timeout_secs)
            .map_err(|e| BrokerError::Fetch(e.to_string()))?;

        Ok(match reply {
            Some((queue, payload)) => vec![RawMessage {
                queue,
                // BRPOP already removed the item; the "system id" here is
                // only a bookkeeping handle for the generic ack-before-
                // dispatch discipline (§4.4.2) — ack() is a no-op for this
                // broker (see module docs).
                system_id: uuid::Uuid::new_v4().to_string(),
                payload,
            }],
            None => Vec::new(),
        })
    }

    fn ack(&mut self, _system_id: &str) -> Result<(), BrokerError> {
        // BRPOP pops destructively; there is nothing left to acknowledge.
        Ok(())
    }

    fn send(&mut self, queue: &str, payload: &str) -> Result<(), BrokerError> {
        let _: i64 = self
            .conn
            .lpush(queue, payload)
            .map_err(|e| BrokerError::Send(e.to_string()))?;
        Ok(())
    }
}
