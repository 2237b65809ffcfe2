//! End-to-end job scenarios: synthetic builds against the simulated card,
//! simulated PLC and fake clock, driven through the full supervisor.

use core_clock::{Clock, FakeClock};
use core_device::{CardOp, DeviceHandle, SimCard};
use core_link::{FaultKind, MachineLink, SimPlc, vars};
use core_pipeline::TimeoutKind;
use core_supervisor::{FailureKind, JobEvent, JobState, Supervisor, SupervisorDeps, SupervisorHandle};
use std::sync::Arc;
use std::time::Duration;

struct Sim {
    clock: Arc<FakeClock>,
    card: Arc<SimCard>,
    device: Arc<DeviceHandle>,
    plc: SimPlc,
    handle: SupervisorHandle,
}

fn sim() -> Sim {
    let clock = Arc::new(FakeClock::new());
    let card = SimCard::new(clock.clone());
    let device = DeviceHandle::new(card.clone());
    let plc = SimPlc::new(clock.clone());
    let (link, link_events) = MachineLink::new(Box::new(plc.clone()));
    let handle = Supervisor::spawn(SupervisorDeps {
        device: device.clone(),
        link,
        link_events,
        clock: clock.clone(),
        config: core_config::defaults(),
    });
    Sim {
        clock,
        card,
        device,
        plc,
        handle,
    }
}

fn is_terminal(event: &JobEvent) -> bool {
    matches!(
        event,
        JobEvent::Finished
            | JobEvent::Stopped
            | JobEvent::EmergencyStopped
            | JobEvent::Failed { .. }
    )
}

/// Collect events (bounded in real time) until a terminal one arrives.
fn collect_until_terminal(handle: &SupervisorHandle) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        let event = handle
            .events()
            .recv_timeout(Duration::from_secs(30))
            .expect("job never reached a terminal event");
        let terminal = is_terminal(&event);
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn completed_layers(events: &[JobEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::LayerCompleted { index } => Some(*index),
            _ => None,
        })
        .collect()
}

fn wait_for_layer(handle: &SupervisorHandle, wanted: u32) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        let event = handle
            .events()
            .recv_timeout(Duration::from_secs(30))
            .expect("expected layer completion");
        assert!(
            !is_terminal(&event),
            "job ended before layer {wanted} completed: {event:?}"
        );
        let hit = matches!(event, JobEvent::LayerCompleted { index } if index == wanted);
        events.push(event);
        if hit {
            return events;
        }
    }
}

// S1 — synthetic, three layers, PLC permanently ready within its delay.
#[test]
fn synthetic_three_layer_build_completes_in_order() {
    let sim = sim();
    sim.handle.start_test(0.2, 3);
    let events = collect_until_terminal(&sim.handle);

    assert_eq!(
        events.first(),
        Some(&JobEvent::Status("starting".to_string())),
        "the first event must announce the start"
    );
    assert_eq!(completed_layers(&events), vec![0, 1, 2]);
    assert_eq!(events.last(), Some(&JobEvent::Finished));

    // Exactly three recoat requests and three acks, strictly alternating.
    let handshakes = sim.plc.bool_writes(vars::LAY_SURFACE);
    let values: Vec<bool> = handshakes.iter().map(|w| w.1).collect();
    assert_eq!(values, vec![true, false, true, false, true, false]);

    // Each ack was written only after the matching execution went idle.
    let exec_starts = sim.card.execution_starts();
    assert_eq!(exec_starts.len(), 4, "warm-up plus one execution per layer");
    let busy = sim.card.busy_duration();
    for (layer, pair) in handshakes.chunks(2).enumerate() {
        assert!(
            pair[1].0 >= exec_starts[layer + 1] + busy,
            "layer {layer} acked before the scanner went idle"
        );
    }
    sim.card.assert_close_before_execute();

    // Progress reporting covered the whole build.
    assert!(events.contains(&JobEvent::Progress {
        current: 3,
        total: 3
    }));

    assert_eq!(sim.device.refcount(), 0);
    assert_eq!(sim.handle.state(), JobState::Stopped);
}

// S2 — the PLC never reports the surface prepared.
#[test]
fn recoat_that_never_readies_times_out_the_job() {
    let sim = sim();
    sim.plc.set_never_ready(true);
    let start = sim.clock.now();
    sim.handle.start_test(0.2, 3);
    let events = collect_until_terminal(&sim.handle);

    assert_eq!(
        events.last(),
        Some(&JobEvent::Failed {
            kind: FailureKind::Timeout(TimeoutKind::Prep),
            detail: "PrepTimeout exceeded".to_string(),
        })
    );
    assert!(completed_layers(&events).is_empty());
    // Only the warm-up cycle ever executed; no layer list ran.
    assert_eq!(sim.card.execution_starts().len(), 1);
    // The ceiling is 60 s of fake time; the job cannot fail earlier.
    assert!(sim.clock.now() - start >= Duration::from_secs(60));
    assert_eq!(sim.device.refcount(), 0);
    assert_eq!(sim.handle.state(), JobState::Failed);
}

// S3 — the card never goes idle after execute.
#[test]
fn scanner_stuck_busy_times_out_with_laser_off() {
    let sim = sim();
    // Warm-up (execution 0) completes; the first layer wedges.
    sim.card.set_stick_busy_after(1);
    sim.handle.start_test(0.2, 3);
    let events = collect_until_terminal(&sim.handle);

    assert_eq!(
        events.last(),
        Some(&JobEvent::Failed {
            kind: FailureKind::Timeout(TimeoutKind::Idle),
            detail: "IdleTimeout exceeded".to_string(),
        })
    );
    assert!(completed_layers(&events).is_empty());

    let ops = sim.card.ops();
    let last_execute = ops.iter().rposition(|op| *op == CardOp::Execute);
    let last_disable = ops.iter().rposition(|op| *op == CardOp::LaserDisable);
    assert!(
        last_disable > last_execute,
        "laser-off must follow the wedged execution"
    );
    assert_eq!(sim.device.refcount(), 0);
}

// S4 — connection loss after the first completed layer.
#[test]
fn connection_loss_mid_run_reports_once_then_fails() {
    let sim = sim();
    sim.plc.fail_after_acks(1);
    sim.handle.start_test(0.2, 3);
    let events = collect_until_terminal(&sim.handle);

    assert_eq!(completed_layers(&events), vec![0]);
    let lost_count = events
        .iter()
        .filter(|e| matches!(e, JobEvent::ConnectionLost))
        .count();
    assert_eq!(lost_count, 1, "ConnectionLost must be reported exactly once");
    assert_eq!(
        events.last(),
        Some(&JobEvent::Failed {
            kind: FailureKind::Disconnected,
            detail: "machine link lost".to_string(),
        })
    );
    let lost_at = events
        .iter()
        .position(|e| matches!(e, JobEvent::ConnectionLost))
        .unwrap();
    assert!(
        lost_at < events.len() - 1,
        "loss notification precedes the terminal event"
    );
    assert_eq!(sim.device.refcount(), 0);
}

// S5 — emergency stop while a layer is in flight.
#[test]
fn emergency_stop_mid_layer_aborts_without_completing_it() {
    let sim = sim();
    // Slow recoat so the job is reliably inside layer 1 when the stop lands.
    sim.plc.set_ready_delay(Duration::from_millis(500));
    sim.handle.start_test(0.2, 3);
    wait_for_layer(&sim.handle, 0);
    sim.handle.emergency_stop();
    let events = collect_until_terminal(&sim.handle);

    assert_eq!(events.last(), Some(&JobEvent::EmergencyStopped));
    let completed = completed_layers(&events);
    assert!(
        !completed.contains(&1) && !completed.contains(&2),
        "no further layer may complete after the emergency stop: {completed:?}"
    );

    let ops = sim.card.ops();
    let last_execute = ops.iter().rposition(|op| *op == CardOp::Execute);
    let last_disable = ops.iter().rposition(|op| *op == CardOp::LaserDisable);
    assert!(last_disable > last_execute, "laser-off must be recorded");
    assert_eq!(sim.device.refcount(), 0);
    assert_eq!(sim.handle.state(), JobState::EmergencyStopped);
}

// S6 — cooperative stop between layers.
#[test]
fn stop_between_layers_ends_with_stopped() {
    let sim = sim();
    sim.plc.set_ready_delay(Duration::from_millis(500));
    sim.handle.start_test(0.2, 3);
    wait_for_layer(&sim.handle, 0);
    sim.handle.stop();
    let events = collect_until_terminal(&sim.handle);

    assert_eq!(events.last(), Some(&JobEvent::Stopped));
    let completed = completed_layers(&events);
    assert!(
        !completed.contains(&2),
        "stop must not let the build run to completion"
    );
    assert_eq!(sim.device.refcount(), 0);
    assert_eq!(sim.handle.state(), JobState::Stopped);
}

#[test]
fn fresh_start_is_permitted_after_a_terminal_state() {
    let sim = sim();
    sim.handle.start_test(0.2, 1);
    let first = collect_until_terminal(&sim.handle);
    assert_eq!(first.last(), Some(&JobEvent::Finished));
    assert_eq!(sim.device.refcount(), 0);

    // Second job on the same supervisor: device reopens, job completes.
    sim.handle.start_test(0.2, 2);
    let second = collect_until_terminal(&sim.handle);
    assert_eq!(completed_layers(&second), vec![0, 1]);
    assert_eq!(second.last(), Some(&JobEvent::Finished));
    assert_eq!(sim.device.refcount(), 0);
}

#[test]
fn pause_and_resume_round_trip() {
    let sim = sim();
    sim.handle.start_test(0.2, 30);
    wait_for_layer(&sim.handle, 0);
    sim.handle.pause();
    // Wait until the supervisor acknowledges the pause.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while sim.handle.state() != JobState::Paused {
        assert!(std::time::Instant::now() < deadline, "pause never applied");
        std::thread::sleep(Duration::from_millis(1));
    }
    sim.handle.resume();
    // After resume the job keeps completing layers.
    let mut saw_later_layer = false;
    for _ in 0..200 {
        match sim.handle.events().recv_timeout(Duration::from_secs(10)) {
            Ok(JobEvent::LayerCompleted { index }) if index >= 2 => {
                saw_later_layer = true;
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(saw_later_layer, "job did not make progress after resume");
    sim.handle.stop();
    let events = collect_until_terminal(&sim.handle);
    assert_eq!(events.last(), Some(&JobEvent::Stopped));
    assert_eq!(sim.device.refcount(), 0);
}

#[test]
fn slice_job_runs_from_disk() {
    use core_geometry::{Layer, Polygon};
    use core_slice::{SliceHeader, SliceWriter};
    use core_units::MmPoint;

    let dir = tempfile::tempdir().unwrap();
    let marc_path = dir.path().join("square.marc");
    let style_path = dir.path().join("styles.json");

    let file = std::fs::File::create(&marc_path).unwrap();
    let mut writer = SliceWriter::new(file, &SliceHeader::new(1, 2)).unwrap();
    for index in 0..2u32 {
        writer
            .write_layer(&Layer {
                index,
                height: 0.03,
                polygons: vec![Polygon {
                    style_id: 1,
                    vertices: vec![
                        MmPoint::new(-5.0, -5.0),
                        MmPoint::new(5.0, -5.0),
                        MmPoint::new(5.0, 5.0),
                        MmPoint::new(-5.0, 5.0),
                    ],
                }],
                ..Layer::default()
            })
            .unwrap();
    }
    writer.finish().unwrap();

    std::fs::write(
        &style_path,
        r#"{
            "buildStyles": [{
                "id": 1,
                "name": "contour",
                "description": "border pass",
                "laserId": 1,
                "laserMode": 1,
                "laserPower": 150,
                "laserFocus": 0.0,
                "laserSpeed": 700.0,
                "hatchSpacing": 0.1,
                "layerThickness": 0.03,
                "pointDistance": 0.05,
                "pointDelay": 10.0,
                "pointExposureTime": 70.0,
                "jumpSpeed": 3000.0,
                "jumpDelay": 150.0
            }]
        }"#,
    )
    .unwrap();

    let sim = sim();
    sim.handle.start(&marc_path, &style_path);
    let events = collect_until_terminal(&sim.handle);
    assert_eq!(completed_layers(&events), vec![0, 1]);
    assert_eq!(events.last(), Some(&JobEvent::Finished));
    // Style 1's power made it to the card.
    assert!(
        sim.card
            .count_ops(|op| *op == CardOp::SetPower { power: 150 })
            >= 2
    );
    assert_eq!(sim.device.refcount(), 0);
}

#[test]
fn missing_slice_file_fails_at_start() {
    let sim = sim();
    sim.handle
        .start("/nonexistent/job.marc", "/nonexistent/styles.json");
    let events = collect_until_terminal(&sim.handle);
    assert!(matches!(
        events.last(),
        Some(JobEvent::Failed {
            kind: FailureKind::Config,
            ..
        })
    ));
    assert_eq!(sim.device.refcount(), 0);
    // The failure happened before any hardware was touched.
    assert!(sim.card.ops().is_empty());
}

#[test]
fn connect_refusal_fails_the_start() {
    let sim = sim();
    sim.plc.refuse_connect(FaultKind::Refused);
    sim.handle.start_test(0.2, 1);
    let events = collect_until_terminal(&sim.handle);
    match events.last() {
        Some(JobEvent::Failed {
            kind: FailureKind::Config,
            detail,
        }) => assert!(detail.contains("refused"), "unexpected detail: {detail}"),
        other => panic!("expected config failure, got {other:?}"),
    }
    assert_eq!(sim.device.refcount(), 0);
    assert_eq!(sim.handle.state(), JobState::Failed);
}
