// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end forking scenarios, driven deterministically through the router
//! handlers and explicit timer firing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use prong_fork::{ForkConfig, TransactionKey};
use prong_registrar::{ContactBinding, MemoryLocationStore, RegistrationEvent};
use prong_router::{Router, RouterEvent};
use prong_testkit::{
    build_invite, build_message, build_response, MockIncoming, MockStack, RecordingListener,
};
use prong_core::SipUri;
use smol_str::SmolStr;

struct Net {
    router: Router,
    stack: Arc<MockStack>,
    store: Arc<MemoryLocationStore>,
    listener: Arc<RecordingListener>,
}

impl Net {
    fn new(cfg: ForkConfig) -> Self {
        let stack = MockStack::new();
        let store = Arc::new(MemoryLocationStore::new());
        let listener = RecordingListener::new();
        let router = Router::new(
            cfg,
            "proxy.example.com",
            Arc::clone(&store) as Arc<dyn prong_registrar::LocationService>,
            Arc::clone(&stack) as Arc<dyn prong_fork::TransactionLayer>,
            Arc::clone(&listener) as Arc<dyn prong_fork::ForkListener>,
        );
        Self {
            router,
            stack,
            store,
            listener,
        }
    }

    fn register(&self, aor: &str, contact: &str, uid: &str) {
        self.store.upsert(
            aor,
            ContactBinding::new(SipUri::parse(contact).unwrap(), uid),
        );
    }

    /// Feeds the branch's response back through the router, looked up by the
    /// contact host it was sent to.
    fn respond_from(&mut self, host: &str, request: &prong_core::Request, code: u16) {
        let tx = self
            .stack
            .outgoing_to(host)
            .unwrap_or_else(|| panic!("no branch was sent toward {host}"));
        let key = prong_fork::OutgoingTransaction::key(tx.as_ref()).clone();
        self.router.handle_response(&key, build_response(request, code));
    }

    /// Runs every timer due within `advance` from now, including the finish
    /// ticks armed while firing.
    fn settle(&mut self, advance: Duration) {
        self.router.fire_due_timers(Instant::now() + advance);
        self.router.fire_due_timers(Instant::now() + advance);
    }
}

#[test]
fn single_branch_rings_then_answers() {
    let mut net = Net::new(ForkConfig::default());
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-a");

    let invite = build_invite("sip:bob@example.com", "z9hG4bKup1", "call-1");
    let incoming = MockIncoming::for_request(&invite);
    net.router.handle_request(invite.clone(), incoming.clone());

    assert_eq!(net.stack.created().len(), 1);
    net.respond_from("10.0.0.1", &invite, 180);
    net.respond_from("10.0.0.1", &invite, 200);

    assert_eq!(incoming.codes(), vec![180, 200]);
    net.settle(Duration::ZERO);
    assert_eq!(net.listener.finished_count(), 1);
    assert_eq!(net.router.context_count(), 0);
}

#[test]
fn first_answer_cancels_the_slower_device() {
    let mut net = Net::new(ForkConfig::default());
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-a");
    net.register("sip:bob@example.com", "sip:bob@10.0.0.2", "uid-b");

    let invite = build_invite("sip:bob@example.com", "z9hG4bKup2", "call-2");
    let incoming = MockIncoming::for_request(&invite);
    net.router.handle_request(invite.clone(), incoming.clone());
    assert_eq!(net.stack.created().len(), 2);

    net.respond_from("10.0.0.1", &invite, 200);
    assert_eq!(incoming.codes(), vec![200]);

    let loser = net.stack.outgoing_to("10.0.0.2").unwrap();
    assert_eq!(loser.cancel_count(), 1);

    net.respond_from("10.0.0.2", &invite, 487);
    assert_eq!(incoming.codes(), vec![200]);

    net.settle(Duration::ZERO);
    assert_eq!(net.listener.finished_count(), 1);
    assert_eq!(net.router.context_count(), 0);
}

#[test]
fn global_decline_short_circuits_the_fork() {
    let mut net = Net::new(ForkConfig::default());
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-a");
    net.register("sip:bob@example.com", "sip:bob@10.0.0.2", "uid-b");

    let invite = build_invite("sip:bob@example.com", "z9hG4bKup3", "call-3");
    let incoming = MockIncoming::for_request(&invite);
    net.router.handle_request(invite.clone(), incoming.clone());

    net.respond_from("10.0.0.1", &invite, 603);
    assert_eq!(incoming.codes(), vec![603]);
    assert_eq!(net.stack.outgoing_to("10.0.0.2").unwrap().cancel_count(), 1);

    net.settle(Duration::ZERO);
    assert_eq!(net.listener.finished_count(), 1);
}

#[test]
fn suppressed_decline_waits_and_picks_the_best() {
    let cfg = ForkConfig {
        fork_no_global_decline: true,
        ..ForkConfig::default()
    };
    let mut net = Net::new(cfg);
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-a");
    net.register("sip:bob@example.com", "sip:bob@10.0.0.2", "uid-b");

    let invite = build_invite("sip:bob@example.com", "z9hG4bKup4", "call-4");
    let incoming = MockIncoming::for_request(&invite);
    net.router.handle_request(invite.clone(), incoming.clone());

    net.respond_from("10.0.0.1", &invite, 603);
    assert!(incoming.codes().is_empty());

    net.respond_from("10.0.0.2", &invite, 486);
    assert_eq!(incoming.codes(), vec![486]);
}

#[test]
fn late_registration_rescues_the_call() {
    let cfg = ForkConfig {
        fork_late: true,
        ..ForkConfig::default()
    };
    let mut net = Net::new(cfg);
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-a");

    let invite = build_invite("sip:bob@example.com", "z9hG4bKup5", "call-5");
    let incoming = MockIncoming::for_request(&invite);
    net.router.handle_request(invite.clone(), incoming.clone());
    assert_eq!(net.stack.created().len(), 1);

    // Bob's desktop registers while the call is still ringing.
    net.router
        .dispatch(RouterEvent::Registration(RegistrationEvent {
            aor: SmolStr::new("sip:bob@example.com"),
            binding: ContactBinding::new(SipUri::parse("sip:bob@10.0.0.9").unwrap(), "uid-x"),
        }));
    assert_eq!(net.stack.created().len(), 2);

    net.respond_from("10.0.0.1", &invite, 408);
    assert!(incoming.codes().is_empty());

    net.respond_from("10.0.0.9", &invite, 200);
    assert_eq!(incoming.codes(), vec![200]);

    net.settle(Duration::ZERO);
    assert_eq!(net.listener.finished_count(), 1);
    assert_eq!(net.router.context_count(), 0);
}

#[test]
fn late_timeout_without_any_answer_times_out_the_caller() {
    let cfg = ForkConfig {
        fork_late: true,
        ..ForkConfig::default()
    };
    let mut net = Net::new(cfg);
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-a");

    let invite = build_invite("sip:bob@example.com", "z9hG4bKup6", "call-6");
    let incoming = MockIncoming::for_request(&invite);
    net.router.handle_request(invite.clone(), incoming.clone());

    net.settle(Duration::from_secs(31));
    assert_eq!(incoming.codes(), vec![408]);
    assert_eq!(net.listener.finished_count(), 1);
    assert_eq!(net.router.context_count(), 0);
}

#[test]
fn re_registration_supersedes_the_stale_branch() {
    let cfg = ForkConfig {
        fork_late: true,
        ..ForkConfig::default()
    };
    let mut net = Net::new(cfg);
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-u");

    let invite = build_invite("sip:bob@example.com", "z9hG4bKup7", "call-7");
    let incoming = MockIncoming::for_request(&invite);
    net.router.handle_request(invite.clone(), incoming.clone());

    // Same device comes back from a different address before answering.
    net.router
        .dispatch(RouterEvent::Registration(RegistrationEvent {
            aor: SmolStr::new("sip:bob@example.com"),
            binding: ContactBinding::new(SipUri::parse("sip:bob@10.0.0.2").unwrap(), "uid-u"),
        }));

    let stale = net.stack.outgoing_to("10.0.0.1").unwrap();
    assert_eq!(stale.cancel_count(), 1);

    // The response on the stale transaction no longer reaches the fork.
    let stale_key = prong_fork::OutgoingTransaction::key(stale.as_ref()).clone();
    net.router.handle_response(&stale_key, build_response(&invite, 200));
    assert!(incoming.codes().is_empty());

    net.respond_from("10.0.0.2", &invite, 200);
    assert_eq!(incoming.codes(), vec![200]);
}

#[test]
fn cancel_from_caller_silences_the_fork() {
    let mut net = Net::new(ForkConfig::default());
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-a");
    net.register("sip:bob@example.com", "sip:bob@10.0.0.2", "uid-b");

    let invite = build_invite("sip:bob@example.com", "z9hG4bKup8", "call-8");
    let incoming = MockIncoming::for_request(&invite);
    net.router.handle_request(invite.clone(), incoming.clone());

    let key = TransactionKey::server("z9hG4bKup8", prong_core::Method::Invite);
    net.router.handle_cancel(&key);

    for tx in net.stack.created() {
        assert_eq!(tx.cancel_count(), 1);
    }

    net.respond_from("10.0.0.1", &invite, 487);
    net.respond_from("10.0.0.2", &invite, 487);
    assert!(incoming.codes().is_empty());

    net.settle(Duration::ZERO);
    assert_eq!(net.listener.finished_count(), 1);
}

#[test]
fn buffered_urgent_final_is_the_only_answer_the_caller_sees() {
    let mut net = Net::new(ForkConfig::default());
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-a");
    net.register("sip:bob@example.com", "sip:bob@10.0.0.2", "uid-b");

    let invite = build_invite("sip:bob@example.com", "z9hG4bKupC", "call-12");
    let incoming = MockIncoming::for_request(&invite);
    net.router.handle_request(invite.clone(), incoming.clone());

    // One device is busy; the other keeps ringing past the urgent window.
    net.respond_from("10.0.0.1", &invite, 486);
    assert!(incoming.codes().is_empty());

    net.settle(Duration::from_secs(6));
    assert_eq!(incoming.codes(), vec![486]);

    // The slow branch finally answers; the upstream transaction already
    // replied and must not see a second final.
    net.respond_from("10.0.0.2", &invite, 503);
    assert_eq!(incoming.codes(), vec![486]);

    net.settle(Duration::ZERO);
    assert_eq!(net.listener.finished_count(), 1);
    assert_eq!(net.router.context_count(), 0);
}

#[test]
fn contexts_are_reachable_through_every_index() {
    let mut net = Net::new(ForkConfig::default());
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-a");

    let invite = build_invite("sip:bob@example.com", "z9hG4bKidx", "call-idx");
    let incoming = MockIncoming::for_request(&invite);
    let id = net
        .router
        .handle_request(invite.clone(), incoming.clone())
        .unwrap();

    let incoming_key = TransactionKey::server("z9hG4bKidx", prong_core::Method::Invite);
    assert_eq!(
        net.router
            .find_context_by_incoming(&incoming_key)
            .map(|ctx| ctx.id()),
        Some(id)
    );

    let tx = net.stack.outgoing_to("10.0.0.1").unwrap();
    let out_key = prong_fork::OutgoingTransaction::key(tx.as_ref()).clone();
    assert_eq!(
        net.router
            .find_context_by_outgoing(&out_key)
            .map(|ctx| ctx.id()),
        Some(id)
    );
    assert_eq!(net.router.find_contexts_by_call_id("call-idx").len(), 1);

    // Every index entry dies with the context.
    net.respond_from("10.0.0.1", &invite, 200);
    net.settle(Duration::ZERO);
    assert!(net.router.find_context_by_incoming(&incoming_key).is_none());
    assert!(net.router.find_context_by_outgoing(&out_key).is_none());
    assert!(net.router.find_contexts_by_call_id("call-idx").is_empty());
}

#[test]
fn unregistered_target_is_rejected_with_480() {
    let mut net = Net::new(ForkConfig::default());

    let invite = build_invite("sip:nobody@example.com", "z9hG4bKup9", "call-9");
    let incoming = MockIncoming::for_request(&invite);
    net.router.handle_request(invite, incoming.clone());

    assert_eq!(incoming.codes(), vec![480]);
    net.settle(Duration::ZERO);
    assert_eq!(net.listener.finished_count(), 1);
    assert_eq!(net.router.context_count(), 0);
}

#[test]
fn message_fork_delivers_to_every_device_and_reports_once() {
    let mut net = Net::new(ForkConfig::default());
    net.register("sip:bob@example.com", "sip:bob@10.0.0.1", "uid-a");
    net.register("sip:bob@example.com", "sip:bob@10.0.0.2", "uid-b");

    let message = build_message("sip:bob@example.com", "z9hG4bKupA", "call-10");
    let incoming = MockIncoming::for_request(&message);
    net.router.handle_request(message.clone(), incoming.clone());
    assert_eq!(net.stack.created().len(), 2);

    net.respond_from("10.0.0.1", &message, 486);
    assert!(incoming.codes().is_empty());

    net.respond_from("10.0.0.2", &message, 200);
    assert_eq!(incoming.codes(), vec![200]);

    net.settle(Duration::ZERO);
    assert_eq!(net.listener.finished_count(), 1);
}

#[test]
fn non_forkable_methods_are_left_alone() {
    let mut net = Net::new(ForkConfig::default());
    let mut register = build_invite("sip:bob@example.com", "z9hG4bKupB", "call-11");
    register.start.method = prong_core::Method::Register;

    let incoming = MockIncoming::for_request(&register);
    assert!(net.router.handle_request(register, incoming.clone()).is_none());
    assert_eq!(net.router.context_count(), 0);
    assert!(incoming.codes().is_empty());
}

#[tokio::test]
async fn event_loop_drives_a_call_to_completion() {
    let stack = MockStack::new();
    let store = Arc::new(MemoryLocationStore::new());
    let listener = RecordingListener::new();
    let mut finished = listener.subscribe();

    store.upsert(
        "sip:bob@example.com",
        ContactBinding::new(SipUri::parse("sip:bob@10.0.0.1").unwrap(), "uid-a"),
    );

    let router = Router::new(
        ForkConfig::default(),
        "proxy.example.com",
        Arc::clone(&store) as Arc<dyn prong_registrar::LocationService>,
        Arc::clone(&stack) as Arc<dyn prong_fork::TransactionLayer>,
        Arc::clone(&listener) as Arc<dyn prong_fork::ForkListener>,
    );
    let (events, receiver) = tokio::sync::mpsc::unbounded_channel();
    let loop_handle = tokio::spawn(router.run(receiver));

    let invite = build_invite("sip:bob@example.com", "z9hG4bKloop", "call-loop");
    let incoming = MockIncoming::for_request(&invite);
    events
        .send(RouterEvent::Request {
            request: invite.clone(),
            incoming: incoming.clone(),
        })
        .unwrap();

    // Wait for the branch to be placed, then answer it.
    let tx = loop {
        if let Some(tx) = stack.outgoing_to("10.0.0.1") {
            break tx;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    let key = prong_fork::OutgoingTransaction::key(tx.as_ref()).clone();
    events
        .send(RouterEvent::Response {
            key,
            response: build_response(&invite, 200),
        })
        .unwrap();

    let done = tokio::time::timeout(Duration::from_secs(2), finished.recv())
        .await
        .expect("fork should finish")
        .expect("listener channel open");
    assert_eq!(listener.finished(), vec![done]);
    assert_eq!(incoming.codes(), vec![200]);

    drop(events);
    loop_handle.await.unwrap();
}
