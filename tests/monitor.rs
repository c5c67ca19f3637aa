//! Monitor integration tests
//!
//! Exercises the registry/bridge wiring end to end over a mock daemon

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use usbguard_applet::config::{Config, DecisionSettings};
use usbguard_applet::decision::DecisionQueue;
use usbguard_applet::monitor::{Notice, NoticeKind, PolicyMonitor};
use usbguard_applet::relay::PresenceEvent;
use usbguard_applet::{IMPLICIT_ID, Target};

mod common;
use common::{Failure, HUB, KEYBOARD, MockHandle, MockTransport, STICK, mock};

fn config() -> Config {
    let mut config = Config::default();
    config.bridge.settle_delay = Duration::from_millis(50);
    config
}

fn drain(notices: &mut UnboundedReceiver<Notice>) -> Vec<Notice> {
    std::iter::from_fn(|| notices.try_recv().ok()).collect()
}

/// Monitor connected to a daemon holding the hub and keyboard
async fn running() -> (PolicyMonitor<MockTransport>, MockHandle, UnboundedReceiver<Notice>) {
    let (transport, handle) = mock();
    handle.set_registered(true);
    handle.set_devices(&[(1, HUB), (2, KEYBOARD)]);

    let (mut monitor, notices) = PolicyMonitor::new(transport, &config());
    assert!(monitor.start().await.unwrap());
    monitor.step().await;
    (monitor, handle, notices)
}

#[tokio::test]
async fn loads_device_tree_on_connect() {
    let (monitor, handle, mut notices) = running().await;

    let registry = monitor.registry();
    assert_eq!(registry.len(), 2);
    let hub = registry.node_by_id(1).unwrap();
    let keyboard = registry.node_by_id(2).unwrap();
    assert_eq!(registry.parent(keyboard), Some(hub));
    assert_eq!(handle.queries(), vec!["match".to_string()]);
    registry.verify().unwrap();

    let notices = drain(&mut notices);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, NoticeKind::Connection { connected: true });
    assert!(!notices[0].notify);
}

#[tokio::test]
async fn reload_skips_held_and_malformed_rules() {
    let (mut monitor, handle, _notices) = running().await;
    handle.set_devices(&[(1, HUB), (2, KEYBOARD), (3, "allow name \"cut"), (4, STICK)]);

    assert_eq!(monitor.load_device_list().await.unwrap(), 1);
    assert!(monitor.registry().contains(4));
    assert!(!monitor.registry().contains(3));
    assert_eq!(monitor.registry().len(), 3);
}

#[tokio::test]
async fn insert_event_reloads_list() {
    let (mut monitor, handle, mut notices) = running().await;
    drain(&mut notices);

    handle.set_devices(&[(1, HUB), (2, KEYBOARD), (4, STICK)]);
    handle.presence(4, 1, STICK);
    monitor.step().await;

    let registry = monitor.registry();
    let stick = registry.node_by_id(4).unwrap();
    assert_eq!(registry.parent(stick), registry.node_by_id(1));

    let notices = drain(&mut notices);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].title, "USB Device Inserted");
    assert_eq!(
        notices[0].kind,
        NoticeKind::Presence {
            id: 4,
            event: PresenceEvent::Insert
        }
    );
    assert!(notices[0].notify);
}

#[tokio::test]
async fn remove_event_cascades() {
    let (mut monitor, handle, mut notices) = running().await;
    drain(&mut notices);

    handle.presence(1, 3, HUB);
    monitor.step().await;

    assert!(monitor.registry().is_empty());
    let notices = drain(&mut notices);
    assert_eq!(notices[0].title, "USB Device Removed");
    assert!(!notices[0].notify);
}

#[tokio::test]
async fn present_and_update_leave_registry_alone() {
    let (mut monitor, handle, mut notices) = running().await;
    drain(&mut notices);

    handle.presence(2, 0, KEYBOARD);
    monitor.step().await;
    handle.presence(2, 2, KEYBOARD);
    monitor.step().await;

    assert_eq!(monitor.registry().len(), 2);
    let titles: Vec<String> = drain(&mut notices).into_iter().map(|n| n.title).collect();
    assert_eq!(titles, vec!["USB Device Present", "USB Device Updated"]);
}

#[tokio::test]
async fn implicit_block_requests_decision() {
    let (mut monitor, handle, mut notices) = running().await;
    drain(&mut notices);
    handle.set_devices(&[(1, HUB), (2, KEYBOARD), (4, STICK)]);
    monitor.load_device_list().await.unwrap();

    handle.policy_changed(4, Target::Allow, Target::Block, STICK, IMPLICIT_ID);
    monitor.step().await;

    let node = monitor.registry().node_by_id(4).unwrap();
    assert_eq!(monitor.registry().get(node).unwrap().target(), Target::Block);

    let notices = drain(&mut notices);
    assert_eq!(notices.len(), 2);
    assert_eq!(notices[0].title, "USB Device Blocked");
    let NoticeKind::DecisionRequired { id, rule, serial } = &notices[1].kind else {
        panic!("expected a decision request, got {:?}", notices[1].kind);
    };
    assert_eq!(*id, 4);
    assert_eq!(rule.name(), "Ultra");
    assert_eq!(serial, "*C*3*0*1*3*5*7*1*4*4");
}

#[tokio::test]
async fn authored_block_needs_no_decision() {
    let (mut monitor, handle, mut notices) = running().await;
    drain(&mut notices);

    handle.policy_changed(2, Target::Allow, Target::Block, KEYBOARD, 12);
    monitor.step().await;

    assert!(
        drain(&mut notices)
            .iter()
            .all(|n| !matches!(n.kind, NoticeKind::DecisionRequired { .. }))
    );
}

#[tokio::test]
async fn unavailable_clears_registry() {
    let (mut monitor, handle, mut notices) = running().await;
    drain(&mut notices);

    handle.unregister();
    monitor.step().await;

    assert!(monitor.registry().is_empty());
    let notices = drain(&mut notices);
    assert_eq!(notices[0].kind, NoticeKind::Connection { connected: false });
}

#[tokio::test]
async fn commit_applies_actionable_staged_targets() {
    let (mut monitor, handle, _notices) = running().await;

    assert!(monitor.stage(1, Target::Block));
    assert!(monitor.stage(2, Target::Match));
    assert!(!monitor.stage(99, Target::Allow));
    assert_eq!(monitor.modified().len(), 2);

    let report = monitor.commit(true).await;

    assert!(report.is_success());
    assert_eq!(report.applied, vec![(1, 1001)]);
    assert_eq!(report.skipped, vec![(2, Target::Match)]);
    assert_eq!(handle.applied(), vec![(1, Target::Block.as_wire(), true)]);
}

#[tokio::test]
async fn daemon_echo_reconciles_staged_target() {
    let (mut monitor, handle, _notices) = running().await;
    monitor.stage(2, Target::Reject);
    monitor.commit(false).await;
    assert_eq!(monitor.modified().len(), 1);

    handle.policy_changed(2, Target::Allow, Target::Reject, KEYBOARD, 1002);
    monitor.step().await;

    assert!(monitor.modified().is_empty());
}

#[tokio::test]
async fn commit_collects_failures_without_aborting() {
    let (mut monitor, handle, mut notices) = running().await;
    drain(&mut notices);
    handle.fail_requests(Some(Failure::Refused));

    monitor.stage(1, Target::Reject);
    monitor.stage(2, Target::Block);
    let report = monitor.commit(false).await;

    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 2);
    assert!(report.applied.is_empty());
    assert_eq!(drain(&mut notices).iter().filter(|n| n.kind == NoticeKind::Failure).count(), 2);
}

#[tokio::test]
async fn reset_reloads_from_scratch() {
    let (mut monitor, handle, _notices) = running().await;
    monitor.stage(2, Target::Block);
    handle.set_devices(&[(1, HUB)]);

    assert_eq!(monitor.reset_device_list().await.unwrap(), 1);
    assert_eq!(monitor.registry().len(), 1);
    assert!(monitor.modified().is_empty());
}

#[tokio::test]
async fn decision_helpers_apply_directly() {
    let (mut monitor, handle, _notices) = running().await;

    assert_eq!(monitor.allow(2, false).await.unwrap(), 1002);
    monitor.block(2, true).await.unwrap();
    monitor.reject(1, false).await.unwrap();

    assert_eq!(
        handle.applied(),
        vec![
            (2, Target::Allow.as_wire(), false),
            (2, Target::Block.as_wire(), true),
            (1, Target::Reject.as_wire(), false),
        ]
    );
}

#[tokio::test]
async fn start_without_daemon_reports_unavailable() {
    let (transport, handle) = mock();
    let (mut monitor, mut notices) = PolicyMonitor::new(transport, &config());

    assert!(!monitor.start().await.unwrap());
    assert_eq!(handle.opens(), 0);
    let notices = drain(&mut notices);
    assert_eq!(notices[0].title, "Connection failed");
    assert_eq!(notices[0].kind, NoticeKind::Failure);
}

#[tokio::test(start_paused = true)]
async fn daemon_appearing_later_is_mirrored() {
    let (transport, handle) = mock();
    handle.set_devices(&[(1, HUB)]);
    let (mut monitor, _notices) = PolicyMonitor::new(transport, &config());
    monitor.start().await.unwrap();

    handle.register();
    monitor.step().await;

    assert!(monitor.bridge().is_connected());
    assert_eq!(monitor.registry().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn events_flow_while_decision_is_pending() {
    let (mut monitor, handle, mut notices) = running().await;
    handle.set_devices(&[(1, HUB), (2, KEYBOARD), (4, STICK)]);
    monitor.load_device_list().await.unwrap();
    drain(&mut notices);

    let mut unanswered = Vec::new();
    let mut decisions = DecisionQueue::new(DecisionSettings::default(), move |_| {
        let (tx, rx) = oneshot::channel();
        unanswered.push(tx);
        rx
    });

    handle.policy_changed(4, Target::Allow, Target::Block, STICK, IMPLICIT_ID);
    monitor.step().await;
    for notice in drain(&mut notices) {
        if let NoticeKind::DecisionRequired { id, rule, serial } = &notice.kind {
            decisions.push(*id, rule, serial);
        }
    }
    assert_eq!(decisions.len(), 1);

    handle.presence(2, 3, KEYBOARD);
    let decision = loop {
        tokio::select! {
            event = monitor.next_event() => monitor.process(event).await,
            decision = decisions.next() => break decision,
        }
    };

    assert!(!monitor.registry().contains(2));
    assert!(decision.timed_out);
    assert_eq!((decision.id, decision.target), (4, Target::Block));

    monitor.apply(decision.id, decision.target, false).await.unwrap();
    assert_eq!(handle.applied(), vec![(4, Target::Block.as_wire(), false)]);
}

#[tokio::test(start_paused = true)]
async fn recovers_after_presence_watch_fails() {
    let (transport, handle) = mock();
    handle.fail_watch(true);
    let (mut monitor, _notices) = PolicyMonitor::new(transport, &config());
    assert!(monitor.start().await.is_err());

    handle.fail_watch(false);
    handle.set_registered(true);
    handle.set_devices(&[(1, HUB)]);
    monitor.step().await;
    monitor.step().await;

    assert!(monitor.bridge().is_connected());
    assert_eq!(monitor.registry().len(), 1);
    assert_eq!(handle.bus_opens(), 2);
}
