// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Parallel forking walkthrough: one INVITE, three registered devices, a
//! late registration, first 2xx wins.
//!
//! ```bash
//! cargo run --example forking_scenario
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prong_core::SipUri;
use prong_fork::{ForkConfig, OutgoingTransaction};
use prong_registrar::{ContactBinding, MemoryLocationStore, RegistrationEvent};
use prong_router::{Router, RouterEvent};
use prong_testkit::{build_invite, build_response, MockIncoming, MockStack, RecordingListener};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let stack = MockStack::new();
    let store = Arc::new(MemoryLocationStore::new());
    let listener = RecordingListener::new();
    let mut finished = listener.subscribe();

    // Bob has two devices registered up front.
    store.upsert(
        "sip:bob@example.com",
        ContactBinding::new(SipUri::parse("sip:bob@192.168.1.100").unwrap(), "mobile"),
    );
    store.upsert(
        "sip:bob@example.com",
        ContactBinding::new(SipUri::parse("sip:bob@192.168.1.101").unwrap(), "desktop"),
    );

    let router = Router::new(
        ForkConfig {
            fork_late: true,
            delivery_timeout: 20,
            ..ForkConfig::default()
        },
        "proxy.example.com",
        Arc::clone(&store) as Arc<dyn prong_registrar::LocationService>,
        Arc::clone(&stack) as Arc<dyn prong_fork::TransactionLayer>,
        Arc::clone(&listener) as Arc<dyn prong_fork::ForkListener>,
    );
    let (events, receiver) = tokio::sync::mpsc::unbounded_channel();
    let loop_handle = tokio::spawn(router.run(receiver));

    println!("Alice calls Bob: forking to 2 registered devices");
    let invite = build_invite("sip:bob@example.com", "z9hG4bKdemo", "demo-call");
    let incoming = MockIncoming::for_request(&invite);
    events.send(RouterEvent::Request {
        request: invite.clone(),
        incoming: incoming.clone(),
    })?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    for tx in stack.created() {
        let target = tx.sent()[0].start.uri.clone();
        println!("  branch sent to {target}");
    }

    // Bob's tablet registers while the phones are ringing.
    println!("Late registration: bob's tablet joins the fork");
    events.send(RouterEvent::Registration(RegistrationEvent {
        aor: "sip:bob@example.com".into(),
        binding: ContactBinding::new(SipUri::parse("sip:bob@192.168.1.102").unwrap(), "tablet"),
    }))?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The mobile rings, the tablet answers first.
    let mobile = stack.outgoing_to("192.168.1.100").unwrap();
    events.send(RouterEvent::Response {
        key: OutgoingTransaction::key(mobile.as_ref()).clone(),
        response: build_response(&invite, 180),
    })?;

    let tablet = stack.outgoing_to("192.168.1.102").unwrap();
    events.send(RouterEvent::Response {
        key: OutgoingTransaction::key(tablet.as_ref()).clone(),
        response: build_response(&invite, 200),
    })?;

    let ctx = tokio::time::timeout(Duration::from_secs(2), finished.recv())
        .await?
        .expect("listener channel open");
    println!("fork {ctx} finished; upstream saw {:?}", incoming.codes());
    for tx in stack.created() {
        if tx.cancel_count() > 0 {
            println!(
                "  losing branch to {} was cancelled",
                tx.sent()[0].start.uri
            );
        }
    }

    drop(events);
    loop_handle.await?;
    Ok(())
}
