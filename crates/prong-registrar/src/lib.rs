// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Location service for the Prong SIP proxy.
//!
//! Maps an address-of-record to its currently-registered contact bindings
//! and fans new registrations out to listeners (the router uses this to
//! drive late forking). Registration processing itself (parsing REGISTER,
//! authentication, expiry negotiation) belongs to the surrounding stack;
//! this crate only stores and serves the outcome.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use prong_core::SipUri;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::debug;

/// One registered contact for an address-of-record.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactBinding {
    /// Where the device can be reached. Push routing data, when present,
    /// travels as URI parameters (`pn-type`, `pn-tok`, `app-id`).
    pub uri: SipUri,
    /// Stable device identifier (`+sip.instance`).
    pub uid: SmolStr,
    /// Caller preference weight from the registration (1.0 highest).
    pub q: f32,
    /// Remaining registration lifetime at insertion time.
    pub expires: Duration,
}

impl ContactBinding {
    pub fn new(uri: SipUri, uid: impl Into<SmolStr>) -> Self {
        Self {
            uri,
            uid: uid.into(),
            q: 1.0,
            expires: Duration::from_secs(3600),
        }
    }

    pub fn with_q(mut self, q: f32) -> Self {
        self.q = q.clamp(0.0, 1.0);
        self
    }

    pub fn with_expires(mut self, expires: Duration) -> Self {
        self.expires = expires;
        self
    }
}

/// A new contact appeared for an address-of-record.
#[derive(Debug, Clone)]
pub struct RegistrationEvent {
    pub aor: SmolStr,
    pub binding: ContactBinding,
}

/// Resolves an address-of-record to its registered contacts.
pub trait LocationService: Send + Sync {
    fn lookup(&self, aor: &str) -> Vec<ContactBinding>;
}

/// Canonical form of an address-of-record: scheme, user and lowercased host;
/// port and parameters dropped.
pub fn normalize_aor(uri: &SipUri) -> SmolStr {
    let scheme = if uri.is_secure() { "sips" } else { "sip" };
    match uri.user() {
        Some(user) => SmolStr::new(format!(
            "{}:{}@{}",
            scheme,
            user,
            uri.host().to_ascii_lowercase()
        )),
        None => SmolStr::new(format!("{}:{}", scheme, uri.host().to_ascii_lowercase())),
    }
}

struct StoredBinding {
    binding: ContactBinding,
    inserted_at: Instant,
}

/// In-memory location store.
///
/// `upsert` of a contact not currently bound emits a [`RegistrationEvent`] on
/// the configured sink; a refresh of an existing binding does not, so fork
/// contexts only hear about genuinely new destinations.
#[derive(Default)]
pub struct MemoryLocationStore {
    bindings: DashMap<SmolStr, Vec<StoredBinding>>,
    events: Option<mpsc::UnboundedSender<RegistrationEvent>>,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the registration event sink.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<RegistrationEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Inserts or refreshes a binding for `aor`.
    ///
    /// A binding matches an existing one when either the uid or the contact
    /// destination is the same; the stored entry is replaced in place.
    pub fn upsert(&self, aor: impl Into<SmolStr>, binding: ContactBinding) {
        let aor = aor.into();
        let mut entry = self.bindings.entry(aor.clone()).or_default();
        let existing = entry.iter_mut().find(|stored| {
            stored.binding.uid == binding.uid
                || stored.binding.uri.same_destination(&binding.uri)
        });

        let is_new = match existing {
            Some(stored) => {
                let moved = !stored.binding.uri.same_destination(&binding.uri);
                stored.binding = binding.clone();
                stored.inserted_at = Instant::now();
                moved
            }
            None => {
                entry.push(StoredBinding {
                    binding: binding.clone(),
                    inserted_at: Instant::now(),
                });
                true
            }
        };
        drop(entry);

        if is_new {
            debug!(%aor, uid = %binding.uid, contact = %binding.uri, "new contact registered");
            if let Some(events) = &self.events {
                let _ = events.send(RegistrationEvent { aor, binding });
            }
        }
    }

    /// Removes the binding with the given uid.
    pub fn remove(&self, aor: &str, uid: &str) {
        if let Some(mut entry) = self.bindings.get_mut(aor) {
            entry.retain(|stored| stored.binding.uid != uid);
        }
    }

    /// Drops every expired binding, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for mut entry in self.bindings.iter_mut() {
            let before = entry.len();
            entry.retain(|stored| now.duration_since(stored.inserted_at) < stored.binding.expires);
            removed += before - entry.len();
        }
        removed
    }
}

impl LocationService for MemoryLocationStore {
    fn lookup(&self, aor: &str) -> Vec<ContactBinding> {
        self.bindings
            .get(aor)
            .map(|entry| entry.iter().map(|stored| stored.binding.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(contact: &str, uid: &str) -> ContactBinding {
        ContactBinding::new(SipUri::parse(contact).unwrap(), uid)
    }

    #[test]
    fn normalizes_aor_to_scheme_user_host() {
        let uri = SipUri::parse("sip:Bob@Example.COM:5070;transport=tcp").unwrap();
        assert_eq!(normalize_aor(&uri).as_str(), "sip:Bob@example.com");
    }

    #[test]
    fn lookup_returns_all_bindings() {
        let store = MemoryLocationStore::new();
        store.upsert("sip:bob@example.com", binding("sip:bob@10.0.0.1", "uid-1"));
        store.upsert("sip:bob@example.com", binding("sip:bob@10.0.0.2", "uid-2"));

        let contacts = store.lookup("sip:bob@example.com");
        assert_eq!(contacts.len(), 2);
        assert!(store.lookup("sip:carol@example.com").is_empty());
    }

    #[test]
    fn new_contact_emits_event_refresh_does_not() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = MemoryLocationStore::new().with_events(tx);

        store.upsert("sip:bob@example.com", binding("sip:bob@10.0.0.1", "uid-1"));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.binding.uid.as_str(), "uid-1");

        store.upsert("sip:bob@example.com", binding("sip:bob@10.0.0.1", "uid-1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn re_register_from_new_address_emits_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = MemoryLocationStore::new().with_events(tx);

        store.upsert("sip:bob@example.com", binding("sip:bob@10.0.0.1", "uid-1"));
        rx.try_recv().unwrap();

        store.upsert("sip:bob@example.com", binding("sip:bob@10.0.0.9", "uid-1"));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.binding.uri.host(), "10.0.0.9");

        // Still a single binding for the device.
        assert_eq!(store.lookup("sip:bob@example.com").len(), 1);
    }

    #[test]
    fn remove_and_cleanup() {
        let store = MemoryLocationStore::new();
        store.upsert("sip:bob@example.com", binding("sip:bob@10.0.0.1", "uid-1"));
        store.upsert(
            "sip:bob@example.com",
            binding("sip:bob@10.0.0.2", "uid-2").with_expires(Duration::ZERO),
        );

        store.remove("sip:bob@example.com", "uid-1");
        assert_eq!(store.cleanup_expired(), 1);
        assert!(store.lookup("sip:bob@example.com").is_empty());
    }
}
