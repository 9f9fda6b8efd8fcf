//! End-to-end lifecycle tests against the in-memory store.
//!
//! These drive a booked appointment through check-in, start and finalize
//! using only the public API, and check the properties that must hold under
//! concurrent scans:
//! - a session is started at most once
//! - attendance orders are assigned from 1 upward
//! - finalize leaves no client pending

use std::sync::{Arc, Barrier};

use chrono::{DateTime, Duration, TimeZone, Utc};

use rollcall_server::broadcast::EventBroadcaster;
use rollcall_server::clock::ManualClock;
use rollcall_server::identity::Identity;
use rollcall_server::lifecycle::{ErrorCode, SessionLifecycleManager};
use rollcall_server::registry::{BookingRequest, InvitationOutcome, Invitee};
use rollcall_server::scheduler::FinalizeSweeper;
use rollcall_server::store::{InMemoryStore, RecordStore};
use rollcall_server::token::{TokenCodec, TokenPayload};
use rollcall_server::types::{AttendanceAction, AttendanceStatus, GlobalStatus, StartMode};

// ============================================================================
// Test Helpers
// ============================================================================

struct World {
    store: Arc<InMemoryStore>,
    clock: ManualClock,
    manager: SessionLifecycleManager,
    appointment_id: String,
}

fn scheduled_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 14, 9, 30, 0).unwrap()
}

fn coach() -> Identity {
    Identity::new("coach-1")
}

fn invitee(user_id: &str) -> Invitee {
    Invitee {
        user_id: Some(user_id.to_string()),
        ..Invitee::default()
    }
}

/// Books a session for `client-1` with the given extra invitees, with the
/// clock ten minutes before the start.
fn world_with(codec: TokenCodec, invitees: &[&str]) -> World {
    let store = Arc::new(InMemoryStore::new());
    let clock = ManualClock::new(scheduled_at() - Duration::minutes(10));
    let manager =
        SessionLifecycleManager::new(store.clone(), Arc::new(clock.clone()), codec);

    let booking = BookingRequest {
        coach_id: "coach-1".to_string(),
        coach_email: Some("coach@example.com".to_string()),
        client_name: Some("Team Falcon".to_string()),
        scheduled_at: scheduled_at(),
        duration_minutes: 45,
        invitees: invitees.iter().map(|id| invitee(id)).collect(),
    };
    let appointment = manager
        .registry()
        .book_appointment(booking, &Identity::new("client-1"))
        .unwrap();

    World {
        store,
        clock,
        manager,
        appointment_id: appointment.id,
    }
}

fn world(invitees: &[&str]) -> World {
    world_with(TokenCodec::unsigned(), invitees)
}

fn issue(world: &World, user_id: &str) -> String {
    let result = world
        .manager
        .generate_participant_token(&world.appointment_id, &Identity::new(user_id));
    assert!(result.success, "{user_id}: {}", result.message);
    result.context.token.unwrap()
}

fn actions(world: &World) -> Vec<AttendanceAction> {
    world
        .manager
        .history(&world.appointment_id)
        .unwrap()
        .into_iter()
        .map(|event| event.action)
        .collect()
}

// ============================================================================
// Check-in flows
// ============================================================================

#[test]
fn all_clients_scanning_auto_starts_with_ordered_attendance() {
    let world = world(&["client-2", "client-3"]);

    let mut orders = Vec::new();
    for user in ["client-2", "client-1", "client-3"] {
        let token = issue(&world, user);
        let result = world.manager.scan_participant_token(&token, &coach());
        assert!(result.success, "{}", result.message);
        orders.push(result.context.attendance_order.unwrap());
        world.clock.advance(Duration::seconds(20));
    }
    assert_eq!(orders, vec![1, 2, 3]);

    let appointment = world
        .store
        .get_appointment(&world.appointment_id)
        .unwrap()
        .unwrap();
    assert_eq!(appointment.global_status, GlobalStatus::Started);
    assert_eq!(appointment.start_mode, Some(StartMode::AutoLastParticipant));
    assert_eq!(
        appointment.finalize_due_at,
        Some(scheduled_at() - Duration::minutes(10) + Duration::seconds(40) + Duration::minutes(45))
    );

    assert_eq!(
        actions(&world),
        vec![
            AttendanceAction::Present,
            AttendanceAction::Present,
            AttendanceAction::Present,
            AttendanceAction::AutoStart,
        ]
    );
}

#[test]
fn appointment_scan_waits_then_starts_when_everyone_is_in() {
    let world = world(&["client-2"]);
    let code = world
        .manager
        .generate_appointment_token(&world.appointment_id, &Identity::new("client-1"))
        .context
        .token
        .unwrap();

    let waiting = world.manager.scan_appointment_token(&code, &coach());
    assert!(!waiting.success);
    assert_eq!(waiting.error_code, Some(ErrorCode::WaitingForClients));
    let counts = waiting.context.counts.unwrap();
    assert_eq!((counts.present, counts.total), (0, 2));

    // Marking one client present is not enough on its own.
    let token = issue(&world, "client-1");
    assert!(world.manager.scan_participant_token(&token, &coach()).success);
    let still_waiting = world.manager.scan_appointment_token(&code, &coach());
    assert_eq!(still_waiting.error_code, Some(ErrorCode::WaitingForClients));

    let token = issue(&world, "client-2");
    let last = world.manager.scan_participant_token(&token, &coach());
    assert_eq!(last.context.auto_started, Some(true));

    let rescan = world.manager.scan_appointment_token(&code, &coach());
    assert!(rescan.success);
    assert!(rescan.is_already());
}

#[test]
fn participant_code_opens_thirty_minutes_before_start() {
    let world = world(&[]);
    let client = Identity::new("client-1");

    world.clock.set(scheduled_at() - Duration::minutes(35));
    let early = world
        .manager
        .generate_participant_token(&world.appointment_id, &client);
    assert!(!early.success);
    assert_eq!(early.error_code, Some(ErrorCode::WindowTooEarly));
    assert_eq!(early.context.opens_in_seconds, Some(300));

    world.clock.set(scheduled_at() - Duration::minutes(20));
    let token = issue(&world, "client-1");
    let scanned = world.manager.scan_participant_token(&token, &coach());
    assert!(scanned.success, "{}", scanned.message);
    assert_eq!(scanned.context.auto_started, Some(true));

    let appointment = world
        .store
        .get_appointment(&world.appointment_id)
        .unwrap()
        .unwrap();
    assert_eq!(appointment.global_status, GlobalStatus::Started);
    assert_eq!(appointment.start_mode, Some(StartMode::AutoLastParticipant));
}

#[test]
fn declined_invitee_does_not_block_auto_start() {
    let world = world(&["client-2"]);
    let invitation = world
        .manager
        .registry()
        .find_client_by_user(&world.appointment_id, "client-2")
        .unwrap()
        .unwrap();
    assert!(matches!(
        world
            .manager
            .registry()
            .respond_to_invitation(&invitation.id, &Identity::new("client-2"), false)
            .unwrap(),
        InvitationOutcome::Updated(_)
    ));

    let token = issue(&world, "client-1");
    let scanned = world.manager.scan_participant_token(&token, &coach());
    assert!(scanned.success, "{}", scanned.message);
    assert_eq!(scanned.context.auto_started, Some(true));
    let counts = world
        .manager
        .counts(&world.appointment_id)
        .unwrap()
        .unwrap();
    assert_eq!((counts.present, counts.total), (1, 1));
}

#[test]
fn concurrent_final_scans_start_the_session_once() {
    for _ in 0..20 {
        let world = world(&["client-2", "client-3"]);
        let first = issue(&world, "client-1");
        assert!(world.manager.scan_participant_token(&first, &coach()).success);

        let tokens = [issue(&world, "client-2"), issue(&world, "client-3")];
        let barrier = Barrier::new(tokens.len());

        let auto_started: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = tokens
                .iter()
                .map(|token| {
                    let manager = world.manager.clone();
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        manager.scan_participant_token(token, &coach())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .inspect(|result| assert!(result.success, "{}", result.message))
                .filter(|result| result.context.auto_started == Some(true))
                .count()
        });

        assert_eq!(auto_started, 1);
        let history = actions(&world);
        assert_eq!(
            history
                .iter()
                .filter(|action| **action == AttendanceAction::AutoStart)
                .count(),
            1
        );
        assert_eq!(
            history
                .iter()
                .filter(|action| **action == AttendanceAction::Present)
                .count(),
            3
        );
    }
}

#[test]
fn concurrent_token_requests_hand_out_one_code() {
    let world = world(&[]);
    let barrier = Barrier::new(4);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = world.manager.clone();
                let barrier = &barrier;
                let appointment_id = world.appointment_id.clone();
                scope.spawn(move || {
                    barrier.wait();
                    manager.generate_participant_token(&appointment_id, &Identity::new("client-1"))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert!(results.iter().all(|result| result.success));
    let tokens: Vec<_> = results
        .iter()
        .map(|result| result.context.token.clone().unwrap())
        .collect();
    assert!(tokens.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(
        results
            .iter()
            .filter(|result| result.context.reused == Some(false))
            .count(),
        1
    );
}

// ============================================================================
// Ending sessions
// ============================================================================

#[test]
fn finalize_marks_stragglers_absent_and_is_idempotent() {
    let world = world(&["client-2", "client-3"]);
    let token = issue(&world, "client-2");
    assert!(world.manager.scan_participant_token(&token, &coach()).success);
    assert!(world
        .manager
        .manual_start(&world.appointment_id, &coach())
        .success);

    // client-1 and client-3 never checked in.
    let finalized = world.manager.finalize_session(&world.appointment_id, &coach());
    assert!(finalized.success, "{}", finalized.message);
    let summary = finalized.context.summary.unwrap();
    assert_eq!((summary.present, summary.absent, summary.total), (1, 2, 3));

    let again = world.manager.finalize_session(&world.appointment_id, &coach());
    assert!(again.success);
    assert!(again.is_already());
    assert_eq!(again.context.summary, Some(summary));

    let history = actions(&world);
    assert_eq!(history.first(), Some(&AttendanceAction::Present));
    assert_eq!(history.last(), Some(&AttendanceAction::End));
    assert_eq!(
        history
            .iter()
            .filter(|action| **action == AttendanceAction::End)
            .count(),
        1
    );

    let late = world
        .manager
        .generate_participant_token(&world.appointment_id, &Identity::new("client-3"));
    assert_eq!(late.error_code, Some(ErrorCode::SessionClosed));
}

#[test]
fn sweep_finalizes_after_scheduled_end() {
    let world = world(&[]);
    let token = issue(&world, "client-1");
    let scanned = world.manager.scan_participant_token(&token, &coach());
    assert_eq!(scanned.context.auto_started, Some(true));

    let sweeper = FinalizeSweeper::new(Arc::new(world.manager.clone()));
    assert_eq!(sweeper.sweep_due().unwrap().due, 0);

    world.clock.advance(Duration::minutes(46));
    let report = sweeper.sweep_due().unwrap();
    assert_eq!(report.finalized, 1);

    let appointment = world
        .store
        .get_appointment(&world.appointment_id)
        .unwrap()
        .unwrap();
    assert_eq!(appointment.global_status, GlobalStatus::Completed);
    assert_eq!(appointment.session_ended_by.as_deref(), Some("system:auto-finalize"));
    assert!(appointment.finalize_due_at.is_none());
}

#[test]
fn absent_client_cannot_check_in_later() {
    let world = world(&["client-2"]);
    let token = issue(&world, "client-2");
    let participant_id = world
        .manager
        .registry()
        .find_client_by_user(&world.appointment_id, "client-2")
        .unwrap()
        .unwrap()
        .id;

    let marked = world
        .manager
        .mark_absent(&world.appointment_id, &participant_id, &coach());
    assert!(marked.success);

    let scanned = world.manager.scan_participant_token(&token, &coach());
    assert_eq!(scanned.error_code, Some(ErrorCode::AlreadyAbsent));
    let record = world.store.get_participant(&participant_id).unwrap().unwrap();
    assert_eq!(record.attendance_status, AttendanceStatus::Absent);
}

// ============================================================================
// Tokens and feed
// ============================================================================

#[test]
fn signed_manager_rejects_unsigned_tokens() {
    let world = world_with(TokenCodec::signed(&[7u8; 32]), &[]);
    let genuine = issue(&world, "client-1");
    let participant_id = world
        .manager
        .registry()
        .find_client_by_user(&world.appointment_id, "client-1")
        .unwrap()
        .unwrap()
        .id;

    let forged = TokenCodec::unsigned().encode(&TokenPayload::new(
        &world.appointment_id,
        &participant_id,
        scheduled_at() - Duration::minutes(10),
    ));
    let rejected = world.manager.scan_participant_token(&forged, &coach());
    assert_eq!(rejected.error_code, Some(ErrorCode::TokenInvalid));

    let signed_elsewhere = TokenCodec::signed(&[9u8; 32]).encode(&TokenPayload::new(
        &world.appointment_id,
        &participant_id,
        scheduled_at() - Duration::minutes(10),
    ));
    let rejected = world.manager.scan_participant_token(&signed_elsewhere, &coach());
    assert_eq!(rejected.error_code, Some(ErrorCode::TokenInvalid));

    assert!(world.manager.scan_participant_token(&genuine, &coach()).success);
}

#[tokio::test]
async fn ledger_entries_reach_feed_subscribers() {
    let broadcaster = EventBroadcaster::new();
    let mut rx = broadcaster.subscribe();

    let store = Arc::new(InMemoryStore::new());
    let clock = ManualClock::new(scheduled_at() - Duration::minutes(5));
    let manager = SessionLifecycleManager::new(store, Arc::new(clock), TokenCodec::unsigned())
        .with_broadcaster(broadcaster);
    let appointment = manager
        .registry()
        .book_appointment(
            BookingRequest {
                coach_id: "coach-1".to_string(),
                coach_email: None,
                client_name: None,
                scheduled_at: scheduled_at(),
                duration_minutes: 30,
                invitees: Vec::new(),
            },
            &Identity::new("client-1"),
        )
        .unwrap();

    let token = manager
        .generate_participant_token(&appointment.id, &Identity::new("client-1"))
        .context
        .token
        .unwrap();
    assert!(manager.scan_participant_token(&token, &coach()).success);

    let present = rx.recv().await.unwrap();
    assert_eq!(present.action, AttendanceAction::Present);
    assert_eq!(present.appointment_id, appointment.id);
    let started = rx.recv().await.unwrap();
    assert_eq!(started.action, AttendanceAction::AutoStart);
    assert!(started.seq > present.seq);
}
