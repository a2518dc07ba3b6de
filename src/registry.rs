//! The table of active mappings and their refresh/expiry timers.
//!
//! Each registered mapping has exactly one armed deadline: either a
//! refresh that re-acquires the mapping before the router drops it, or a
//! one-shot eviction once the granted lifetime has run out. The registry
//! is a [`Stream`] of those deadline events; the owning service selects on
//! it next to its message channel.

use std::collections::BTreeMap;
use std::future::Future;
use std::num::NonZeroU16;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_lite::Stream;
use tokio::time::{Duration, Instant, Sleep};
use tracing::trace;

use crate::defaults::STATIC_REFRESH_INTERVAL;
use crate::mapping::Mapping;

/// A deadline event for one registered mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// The mapping must be re-acquired now to keep the hole open.
    Refresh {
        external_port: NonZeroU16,
        internal_port: NonZeroU16,
        /// Lifetime to ask for on the re-add.
        lifetime_seconds: u32,
    },
    /// The granted lifetime ran out; the entry has been evicted.
    Expired { external_port: NonZeroU16 },
}

/// What happens when an entry's deadline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Armed {
    Refresh { lifetime_seconds: u32 },
    Expire,
}

#[derive(Debug)]
struct Entry {
    mapping: Mapping,
    deadline: Instant,
    armed: Armed,
}

/// Active mappings keyed by external port, with their armed deadlines.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: BTreeMap<u16, Entry>,
    /// Timer for the earliest deadline, re-armed lazily while polling.
    timer: Option<Pin<Box<Sleep>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a mapping that was requested with `requested_lifetime`
    /// seconds, arming its timer:
    ///
    /// - requested 0: static mapping, refresh on a 24 h cadence;
    /// - granted shorter than requested: refresh when the grant runs out,
    ///   asking for the remainder so the total honours the caller;
    /// - otherwise: evict once the grant runs out.
    ///
    /// An existing entry for the same external port is replaced and its
    /// timer disarmed.
    pub(crate) fn insert(&mut self, mapping: Mapping, requested_lifetime: u32) {
        let granted = mapping.lifetime_seconds();
        let (deadline, armed) = if requested_lifetime == 0 {
            (
                Instant::now() + STATIC_REFRESH_INTERVAL,
                Armed::Refresh {
                    lifetime_seconds: 0,
                },
            )
        } else if granted < requested_lifetime {
            (
                Instant::now() + Duration::from_secs(granted.into()),
                Armed::Refresh {
                    lifetime_seconds: requested_lifetime - granted,
                },
            )
        } else {
            (
                Instant::now() + Duration::from_secs(granted.into()),
                Armed::Expire,
            )
        };

        let port = mapping.external_port().get();
        trace!("registering {mapping}, {armed:?} in {:?}", deadline - Instant::now());
        let old = self.entries.insert(
            port,
            Entry {
                mapping,
                deadline,
                armed,
            },
        );
        if old.is_some() {
            trace!("replaced previous entry for port {port}");
        }
    }

    /// Removes an entry, disarming its timer. Returns the mapping so the
    /// caller can release it.
    pub(crate) fn remove(&mut self, external_port: u16) -> Option<Mapping> {
        self.entries
            .remove(&external_port)
            .map(|entry| entry.mapping)
    }

    pub(crate) fn get(&self, external_port: u16) -> Option<&Mapping> {
        self.entries.get(&external_port).map(|entry| &entry.mapping)
    }

    pub(crate) fn contains(&self, external_port: u16) -> bool {
        self.entries.contains_key(&external_port)
    }

    /// Snapshot of the table, keyed by external port.
    pub(crate) fn snapshot(&self) -> BTreeMap<u16, Mapping> {
        self.entries
            .iter()
            .map(|(&port, entry)| (port, entry.mapping.clone()))
            .collect()
    }

    /// Drains every entry, disarming all timers. Used by `close`.
    pub(crate) fn drain(&mut self) -> Vec<Mapping> {
        let entries = std::mem::take(&mut self.entries);
        entries.into_values().map(|entry| entry.mapping).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry with the earliest armed deadline.
    fn next_deadline(&self) -> Option<(u16, Instant)> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.deadline)
            .map(|(&port, entry)| (port, entry.deadline))
    }
}

impl Stream for Registry {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some((port, deadline)) = this.next_deadline() else {
            // nothing armed; the owner re-polls after every mutation
            this.timer = None;
            return Poll::Pending;
        };

        match this.timer.as_mut() {
            Some(timer) => {
                if timer.deadline() != deadline {
                    timer.as_mut().reset(deadline);
                }
            }
            None => this.timer = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
        let timer = this.timer.as_mut().expect("armed above");

        match timer.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                let entry = this.entries.remove(&port).expect("deadline entry exists");
                this.timer = None;
                let event = match entry.armed {
                    Armed::Refresh { lifetime_seconds } => Event::Refresh {
                        external_port: entry.mapping.external_port(),
                        internal_port: entry.mapping.internal_port(),
                        lifetime_seconds,
                    },
                    Armed::Expire => Event::Expired {
                        external_port: entry.mapping.external_port(),
                    },
                };
                trace!("deadline fired: {event:?}");
                Poll::Ready(Some(event))
            }
        }
    }
}
