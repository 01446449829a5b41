// Goldwatch - an auction house data service
// Copyright (C) 2023 Goldwatch contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::error::{Error, Result};

pub mod subjects {
    pub const STATUS: &str = "status";
    pub const AUCTIONS: &str = "auctions";
    pub const PRICE_LIST: &str = "price-list";
    pub const PRICE_LIST_HISTORY: &str = "price-list-history";
    pub const OWNERS_QUERY: &str = "owners-query";
    pub const OWNERS_QUERY_BY_ITEMS: &str = "owners-query-by-items";
    pub const ITEMS_QUERY: &str = "items-query";
    pub const BOOT: &str = "boot";
    pub const AUCTIONS_INTAKE: &str = "auctions-intake";
    pub const PRICELISTS_INTAKE: &str = "pricelists-intake";
    pub const METRICS: &str = "metrics";
}

pub const BOOT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const BULK_INTAKE_TIMEOUT: Duration = Duration::from_secs(200);

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Code {
    Ok,
    GenericError,
    ParseError,
    NotFound,
}

impl From<Code> for i32 {
    fn from(code: Code) -> i32 {
        match code {
            Code::Ok => 1,
            Code::GenericError => -1,
            Code::ParseError => -2,
            Code::NotFound => -3,
        }
    }
}

impl TryFrom<i32> for Code {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Code, String> {
        match value {
            1 => Ok(Code::Ok),
            -1 => Ok(Code::GenericError),
            -2 => Ok(Code::ParseError),
            -3 => Ok(Code::NotFound),
            other => Err(format!("unknown message code {other}")),
        }
    }
}

impl From<&Error> for Code {
    fn from(err: &Error) -> Code {
        match err {
            Error::Parse(_) => Code::ParseError,
            Error::NotFound(_) => Code::NotFound,
            _ => Code::GenericError,
        }
    }
}

/// Response envelope. Non-`Ok` codes carry a short human-readable `err`;
/// no stack traces cross the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub err: String,
    pub code: Code,
}

impl Message {
    pub fn ok(data: String) -> Self {
        Message {
            data,
            err: String::new(),
            code: Code::Ok,
        }
    }

    pub fn error(code: Code, err: impl std::fmt::Display) -> Self {
        Message {
            data: String::new(),
            err: err.to_string(),
            code,
        }
    }
}

impl From<&Error> for Message {
    fn from(err: &Error) -> Message {
        Message::error(Code::from(err), err)
    }
}

/// A message as a subscriber sees it.
#[derive(Debug, Clone)]
pub struct BusMsg {
    pub subject: String,
    pub reply_to: Option<String>,
    pub data: Vec<u8>,
}

struct Shared {
    subscriptions: Mutex<HashMap<String, HashMap<u64, mpsc::Sender<BusMsg>>>>,
    replies: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    next_subscription_id: AtomicU64,
}

/// In-process pub/sub with request/reply. Cloning yields another handle to
/// the same bus; handlers across subjects run concurrently, replies may
/// come back in any order relative to request arrival.
#[derive(Clone)]
pub struct Bus {
    shared: Arc<Shared>,
    client_id: Arc<str>,
}

impl Bus {
    pub fn connect() -> Bus {
        Bus {
            shared: Arc::new(Shared {
                subscriptions: Mutex::new(HashMap::new()),
                replies: Mutex::new(HashMap::new()),
                next_subscription_id: AtomicU64::new(0),
            }),
            client_id: Uuid::new_v4().to_string().into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn deliver(&self, msg: BusMsg) -> Result<usize> {
        let targets: Vec<(u64, mpsc::Sender<BusMsg>)> = {
            let subscriptions = self.shared.subscriptions.lock().expect("bus lock");
            subscriptions
                .get(&msg.subject)
                .map(|subs| subs.iter().map(|(id, tx)| (*id, tx.clone())).collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, target) in targets {
            match target.send(msg.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut subscriptions = self.shared.subscriptions.lock().expect("bus lock");
            if let Some(subs) = subscriptions.get_mut(&msg.subject) {
                for id in dead {
                    subs.remove(&id);
                }
            }
        }

        Ok(delivered)
    }

    /// Fire-and-forget. Absent subscribers are not an error.
    pub async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<()> {
        trace!(subject, bytes = data.len(), "Publishing");
        self.deliver(BusMsg {
            subject: subject.to_owned(),
            reply_to: None,
            data,
        })
        .await?;
        Ok(())
    }

    /// Messages sitting unhandled in a subject's subscription buffers.
    pub fn queued(&self, subject: &str) -> usize {
        let subscriptions = self.shared.subscriptions.lock().expect("bus lock");
        subscriptions
            .get(subject)
            .map(|subs| {
                subs.values()
                    .map(|tx| tx.max_capacity() - tx.capacity())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Subscribe a handler; the returned handle resolves exactly once, when
    /// the listener has fully stopped after `stop` fires.
    pub fn subscribe<H, Fut>(
        &self,
        subject: &str,
        stop: CancellationToken,
        handler: H,
    ) -> JoinHandle<()>
    where
        H: Fn(BusMsg) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<BusMsg>(SUBSCRIPTION_BUFFER);
        let id = self
            .shared
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed);
        {
            let mut subscriptions = self.shared.subscriptions.lock().expect("bus lock");
            subscriptions
                .entry(subject.to_owned())
                .or_default()
                .insert(id, tx);
        }
        debug!(subject, subscriber = %self.client_id, "Subscribed");

        let subject = subject.to_owned();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => handler(msg).await,
                        None => break,
                    },
                }
            }

            let mut subscriptions = shared.subscriptions.lock().expect("bus lock");
            if let Some(subs) = subscriptions.get_mut(&subject) {
                subs.remove(&id);
            }
            info!(subject, "Listener stopped");
        })
    }

    pub async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.shared
            .replies
            .lock()
            .expect("bus lock")
            .insert(inbox.clone(), tx);

        let cleanup = |shared: &Shared| {
            shared.replies.lock().expect("bus lock").remove(&inbox);
        };

        let delivered = self
            .deliver(BusMsg {
                subject: subject.to_owned(),
                reply_to: Some(inbox.clone()),
                data,
            })
            .await?;
        if delivered == 0 {
            cleanup(&self.shared);
            return Err(Error::transient(format!("no responders on {subject}")));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                cleanup(&self.shared);
                Err(Error::transient(format!("reply channel closed on {subject}")))
            }
            Err(_) => {
                cleanup(&self.shared);
                Err(Error::transient(format!("request timed out on {subject}")))
            }
        }
    }

    /// Reply to a request. A requester that has already given up is fine.
    pub fn reply_to(&self, msg: &BusMsg, reply: Message) -> Result<()> {
        let Some(inbox) = &msg.reply_to else {
            return Err(Error::invariant(format!(
                "reply to a message without a reply subject on {}",
                msg.subject
            )));
        };

        let sender = self
            .shared
            .replies
            .lock()
            .expect("bus lock")
            .remove(inbox);
        match sender {
            Some(sender) => {
                if sender.send(reply).is_err() {
                    trace!(subject = %msg.subject, "Requester gone before reply");
                }
            }
            None => trace!(subject = %msg.subject, "Reply inbox already drained"),
        }
        Ok(())
    }

    /// Issue many requests on one subject, preserving input order in the
    /// output.
    pub async fn bulk_request(
        &self,
        subject: &str,
        payloads: Vec<Vec<u8>>,
        timeout: Duration,
    ) -> Vec<Result<Message>> {
        futures::future::join_all(
            payloads
                .into_iter()
                .map(|payload| self.request(subject, payload, timeout)),
        )
        .await
    }
}
