use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use float_cmp::approx_eq;
use rstest::rstest;

use super::*;
use crate::{
    solver::FixedPoint,
    test_slaves::{Affine, Fault, Integrator, Misbehaving, StepLimited, INPUT, OUTPUT},
    FailureReason, WeakConnection,
};

fn options() -> MasterOptions {
    MasterOptions {
        wait_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    }
}

fn coordinator(slaves: Vec<SlaveHandle>, connections: Connections) -> Coordinator {
    Coordinator::new(slaves, connections, Box::new(Jacobi), options())
        .expect("valid coordinator")
}

/// `a: y = 2 - x`, `b: out = u / 2`, coupled both ways by strong connections.
fn algebraic_loop() -> Coordinator {
    let a = SlaveId(0);
    let b = SlaveId(1);
    coordinator(
        vec![Affine::spawn("a", -1.0, 2.0), Affine::spawn("b", 0.5, 0.0)],
        Connections::default()
            .strong((a, OUTPUT), (b, INPUT))
            .strong((b, OUTPUT), (a, INPUT)),
    )
}

fn weak_chain(policy: Box<dyn SteppingPolicy>) -> Coordinator {
    let connections = Connections::default()
        .weak((SlaveId(0), OUTPUT), (SlaveId(1), INPUT))
        .weak((SlaveId(1), OUTPUT), (SlaveId(2), INPUT));
    Coordinator::new(
        vec![
            Integrator::spawn("a", 1.0),
            Integrator::spawn("b", 0.0),
            Integrator::spawn("c", 0.0),
        ],
        connections,
        policy,
        options(),
    )
    .expect("valid coordinator")
}

#[test_log::test]
fn test_algebraic_loop_converges() {
    let mut master = algebraic_loop();
    master.prepare(0.0).unwrap();

    let u = master.get_real(SlaveId(1), &[INPUT]).unwrap()[0];
    let x = master.get_real(SlaveId(0), &[INPUT]).unwrap()[0];
    assert!(approx_eq!(f64, u, 4.0 / 3.0, epsilon = 1e-7), "u = {u}");
    assert!(approx_eq!(f64, x, 2.0 / 3.0, epsilon = 1e-7), "x = {x}");

    let stats = master.stats();
    assert_eq!(stats.loop_solves, 1);
    assert!(stats.residual_evaluations <= 10, "{stats:?}");
    assert_eq!(master.get_num_pending_requests(), 0);

    // Storage holds the last evaluation, made at the root.
    assert_eq!(master.storage().unknowns().len(), 2);
    assert!(approx_eq!(
        f64,
        master.storage().outputs()[0],
        master.storage().unknowns()[0],
        epsilon = 1e-7
    ));

    master.run_iteration(0.0, 0.1).unwrap();
    assert_eq!(master.state(), MasterState::Stepping { time: 0.1 });
    master.terminate().unwrap();
}

#[test_log::test]
fn test_identity_loop_needs_one_evaluation() {
    let a = SlaveId(0);
    let mut master = coordinator(
        vec![Affine::spawn("a", 1.0, 0.0)],
        Connections::default().strong((a, OUTPUT), (a, INPUT)),
    );
    master.prepare(0.0).unwrap();
    assert_eq!(master.stats().residual_evaluations, 1);
}

#[test_log::test]
fn test_loop_without_solution() {
    let a = SlaveId(0);
    let mut master = coordinator(
        vec![Affine::spawn("a", 1.0, 1.0)],
        Connections::default().strong((a, OUTPUT), (a, INPUT)),
    );

    let err = master.prepare(0.0).unwrap_err();
    let Error::Convergence(failure) = err else {
        panic!("expected a convergence failure, got {err}");
    };
    assert_eq!(failure.unknowns, vec!["a.u".to_owned()]);
    assert_eq!(failure.reason, FailureReason::SingularJacobian);
    assert!(failure.iterations <= master.options().solver.max_iterations);
    assert!(approx_eq!(f64, failure.residual_norm, 1.0, epsilon = 1e-9));
    // The solver gives up near the guess instead of jumping far away
    let last = master.storage().unknowns()[0];
    assert!(last.abs() <= 2.0, "last evaluation at {last}");
    assert_eq!(master.get_num_pending_requests(), 0);
    assert_eq!(master.state(), MasterState::Constructed);
}

#[test_log::test]
fn test_iteration_bound_with_fixed_point() {
    let a = SlaveId(0);
    let mut master = Coordinator::new(
        vec![Affine::spawn("a", 1.0, 1.0)],
        Connections::default().strong((a, OUTPUT), (a, INPUT)),
        Box::new(Jacobi),
        MasterOptions {
            solver: SolverOptions {
                max_iterations: 5,
                ..Default::default()
            },
            ..options()
        },
    )
    .unwrap()
    .with_root_finder(FixedPoint::default());

    let Err(Error::Convergence(failure)) = master.prepare(0.0) else {
        panic!("expected a convergence failure");
    };
    assert_eq!(failure.reason, FailureReason::MaxIterations);
    assert_eq!(failure.iterations, 5);
    assert_eq!(master.stats().residual_evaluations, 6);
}

#[test_log::test]
fn test_weak_only_request_count() {
    let mut master = weak_chain(Box::new(Jacobi));
    master.prepare(0.0).unwrap();

    for step in 0..3 {
        let before = master.stats();
        master.run_iteration(step as f64 * 0.1, 0.1).unwrap();
        let after = master.stats();
        // Two weak consumers to set, three slaves to advance
        assert_eq!(after.requests_sent - before.requests_sent, 2 + 3);
    }
    assert_eq!(master.stats().loop_solves, 0);
    assert_eq!(master.stats().residual_evaluations, 0);
    assert_eq!(master.stats().steps, 3);
}

#[test_log::test]
fn test_weak_propagation_is_idempotent() {
    let mut master = weak_chain(Box::new(Jacobi));
    master.prepare(0.0).unwrap();
    master.run_iteration(0.0, 0.5).unwrap();

    master.propagate_weak().unwrap();
    let once = [
        master.get_real(SlaveId(1), &[INPUT]).unwrap(),
        master.get_real(SlaveId(2), &[INPUT]).unwrap(),
    ];
    master.propagate_weak().unwrap();
    let twice = [
        master.get_real(SlaveId(1), &[INPUT]).unwrap(),
        master.get_real(SlaveId(2), &[INPUT]).unwrap(),
    ];
    assert_eq!(once, twice);
    assert_eq!(once[0], vec![0.5]);
}

#[test_log::test]
fn test_weak_propagation_through_feedthrough_is_idempotent() {
    // a: y = 3, b: y = u, c: y = u
    let connections = Connections::default()
        .weak((SlaveId(0), OUTPUT), (SlaveId(1), INPUT))
        .weak((SlaveId(1), OUTPUT), (SlaveId(2), INPUT));
    let mut master = coordinator(
        vec![
            Affine::spawn("a", 0.0, 3.0),
            Affine::spawn("b", 1.0, 0.0),
            Affine::spawn("c", 1.0, 0.0),
        ],
        connections,
    );
    master.prepare(0.0).unwrap();

    master.propagate_weak().unwrap();
    let once = [
        master.get_real(SlaveId(1), &[INPUT]).unwrap(),
        master.get_real(SlaveId(2), &[INPUT]).unwrap(),
    ];
    master.propagate_weak().unwrap();
    let twice = [
        master.get_real(SlaveId(1), &[INPUT]).unwrap(),
        master.get_real(SlaveId(2), &[INPUT]).unwrap(),
    ];
    assert_eq!(once, twice);
    // c still sees b's output from the start time
    assert_eq!(once, [vec![3.0], vec![0.0]]);

    // After a step b reports the value it received, and c gets it one step late.
    master.run_iteration(0.0, 0.1).unwrap();
    master.propagate_weak().unwrap();
    assert_eq!(master.get_real(SlaveId(2), &[INPUT]).unwrap(), vec![3.0]);
}

#[test_log::test]
fn test_weak_transform() {
    let mut connections = Connections::default();
    connections.push_weak(
        WeakConnection::new((SlaveId(0), OUTPUT), (SlaveId(1), INPUT)).with_transform(-2.0, 1.0),
    );
    let mut master = coordinator(
        vec![Affine::spawn("a", 0.0, 3.0), Affine::spawn("b", 1.0, 0.0)],
        connections,
    );
    master.prepare(0.0).unwrap();
    master.propagate_weak().unwrap();
    assert_eq!(master.get_real(SlaveId(1), &[INPUT]).unwrap(), vec![-5.0]);
}

#[rstest]
#[case::jacobi(Box::new(Jacobi), 0.0)]
#[case::gauss_seidel(Box::new(GaussSeidel), 0.1)]
fn test_policy_ordering(#[case] policy: Box<dyn SteppingPolicy>, #[case] expected: f64) {
    let mut master = Coordinator::new(
        vec![Integrator::spawn("a", 1.0), Affine::spawn("b", 1.0, 0.0)],
        Connections::default().weak((SlaveId(0), OUTPUT), (SlaveId(1), INPUT)),
        policy,
        options(),
    )
    .unwrap();
    master.prepare(0.0).unwrap();
    master.run_iteration(0.0, 0.1).unwrap();

    let b = master.proxy(SlaveId(1)).unwrap();
    assert_eq!(b.time(), Some(0.1));
    assert!(approx_eq!(
        f64,
        b.cached_value(OUTPUT).unwrap(),
        expected,
        epsilon = 1e-12
    ));
}

#[test_log::test]
fn test_send_and_wait() {
    let mut master = algebraic_loop();
    master.prepare(0.0).unwrap();

    master
        .send_many(&[SlaveId(0), SlaveId(1)], &Command::GetReal { vrs: vec![OUTPUT] })
        .unwrap();
    master.send(SlaveId(0), Command::GetVersion).unwrap();
    master.wait().unwrap();
    assert_eq!(master.get_num_pending_requests(), 0);
    assert_eq!(master.get_num_force_outputs(), 0);

    // Waiting with nothing outstanding returns immediately.
    master.wait().unwrap();
}

#[test_log::test]
fn test_events_reach_listeners() {
    let stepped = Arc::new(Mutex::new(Vec::new()));
    let versions = Arc::new(Mutex::new(Vec::new()));

    let mut master = weak_chain(Box::new(Jacobi));
    let s = stepped.clone();
    master.on(SlaveEventKind::Stepped, move |event| {
        if let EventData::Stepped { time, values, .. } = event.data {
            s.lock().unwrap().push((event.name.to_owned(), time, values.to_vec()));
        }
    });
    let v = versions.clone();
    master.on(SlaveEventKind::GotVersion, move |event| {
        if let EventData::GotVersion(version) = event.data {
            v.lock().unwrap().push(version.to_owned());
        }
    });

    master.prepare(0.0).unwrap();
    master.run_iteration(0.0, 0.25).unwrap();

    assert_eq!(*versions.lock().unwrap(), vec!["2.0"; 3]);
    let stepped = stepped.lock().unwrap();
    assert_eq!(stepped.len(), 3);
    assert!(stepped.contains(&("a".to_owned(), 0.25, vec![0.25])));
}

#[test_log::test]
fn test_rollback() {
    let mut master = weak_chain(Box::new(Jacobi));
    master.prepare(0.0).unwrap();
    master.run_iteration(0.0, 0.1).unwrap();

    let snapshot = master.save_states().unwrap();
    master.run_iteration(0.1, 0.1).unwrap();
    let advanced = master.get_real(SlaveId(0), &[OUTPUT]).unwrap();

    master.restore_states(&snapshot).unwrap();
    assert_eq!(master.state(), MasterState::Stepping { time: 0.1 });
    let restored = master.get_real(SlaveId(0), &[OUTPUT]).unwrap();
    assert!(approx_eq!(f64, restored[0], 0.1, epsilon = 1e-12));

    master.run_iteration(0.1, 0.1).unwrap();
    assert_eq!(master.get_real(SlaveId(0), &[OUTPUT]).unwrap(), advanced);

    master.free_states(snapshot).unwrap();
}

#[test_log::test]
fn test_rollback_after_loop_failure() {
    let limited = SlaveId(0);
    let mut master = coordinator(
        vec![
            StepLimited::spawn("limited", 0.06),
            Integrator::spawn("clock", 1.0),
        ],
        Connections::default().strong((limited, OUTPUT), (limited, INPUT)),
    );
    master.prepare(0.0).unwrap();
    master.run_iteration(0.0, 0.05).unwrap();
    let before = master.get_real(SlaveId(1), &[INPUT, OUTPUT]).unwrap();

    let snapshot = master.save_states().unwrap();
    let Err(Error::Convergence(failure)) = master.run_iteration(0.05, 0.1) else {
        panic!("expected the loop to fail after a long step");
    };
    assert_eq!(failure.unknowns, vec!["limited.u".to_owned()]);
    assert_eq!(master.get_num_pending_requests(), 0);

    master.restore_states(&snapshot).unwrap();
    assert_eq!(master.state(), MasterState::Stepping { time: 0.05 });
    assert_eq!(master.get_real(SlaveId(1), &[INPUT, OUTPUT]).unwrap(), before);

    // Half the step stays within the limit
    master.run_iteration(0.05, 0.05).unwrap();
    master.free_states(snapshot).unwrap();
    assert_eq!(master.time(), Some(0.1));
    let clock = master.get_real(SlaveId(1), &[OUTPUT]).unwrap()[0];
    assert!(approx_eq!(f64, clock, 0.1, epsilon = 1e-12), "clock = {clock}");
}

#[test_log::test]
fn test_loop_states_reach_storage() {
    // clock.u = 1 - 2 * gain.u, gain.u = clock.x
    let (clock, gain) = (SlaveId(0), SlaveId(1));
    let mut master = coordinator(
        vec![Integrator::spawn("clock", 1.0), Affine::spawn("gain", -2.0, 1.0)],
        Connections::default()
            .strong((clock, OUTPUT), (gain, INPUT))
            .strong((gain, OUTPUT), (clock, INPUT)),
    );
    master.prepare(0.0).unwrap();
    assert_eq!(master.storage().states(0), &[0.0]);

    master.run_iteration(0.0, 0.5).unwrap();
    assert_eq!(master.storage().total_states(), 1);
    assert_eq!(master.storage().states(0), &[0.5]);
    assert!(master.storage().states(1).is_empty());
    assert_eq!(master.proxy(clock).unwrap().states(), &[0.5]);
}

#[test_log::test]
fn test_step_must_start_where_slaves_are() {
    let mut master = weak_chain(Box::new(Jacobi));
    master.prepare(0.0).unwrap();
    assert_eq!(master.time(), Some(0.0));
    let before = master.stats();

    assert!(matches!(
        master.run_iteration(0.5, 0.1),
        Err(Error::Config(_))
    ));
    assert_eq!(master.stats(), before);

    master.run_iteration(0.0, 0.1).unwrap();
    assert!(matches!(
        master.run_iteration(0.0, 0.1),
        Err(Error::Config(_))
    ));
    assert_eq!(master.time(), Some(0.1));
    master.run_iteration(0.1, 0.1).unwrap();
    assert_eq!(master.state(), MasterState::Stepping { time: 0.2 });
}

#[test_log::test]
fn test_requests_after_free_fail() {
    let mut master = weak_chain(Box::new(Jacobi));
    master.prepare(0.0).unwrap();
    master.terminate().unwrap();
    assert_eq!(master.time(), None);

    assert!(matches!(
        master.send(SlaveId(0), Command::GetVersion),
        Err(Error::Disconnected { slave: SlaveId(0), .. })
    ));
    assert_eq!(master.get_num_pending_requests(), 0);
}

#[test_log::test]
fn test_directional_derivative() {
    let mut master = coordinator(vec![Affine::spawn("a", 3.0, 0.0)], Connections::default());
    master.prepare(0.0).unwrap();
    let derivative = master
        .directional_derivative(SlaveId(0), &[OUTPUT], &[INPUT], &[2.0])
        .unwrap();
    assert_eq!(derivative, vec![6.0]);
}

#[test_log::test]
fn test_invalid_state() {
    let mut master = algebraic_loop();
    assert!(matches!(
        master.run_iteration(0.0, 0.1),
        Err(Error::InvalidState {
            operation: "run_iteration",
            state: MasterState::Constructed
        })
    ));

    master.prepare(0.0).unwrap();
    assert!(matches!(
        master.prepare(0.0),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        master.run_iteration(0.0, 0.0),
        Err(Error::Config(_))
    ));

    master.terminate().unwrap();
    assert_eq!(master.state(), MasterState::Terminated);
    assert!(matches!(
        master.run_iteration(0.0, 0.1),
        Err(Error::InvalidState { .. })
    ));
}

#[test_log::test]
fn test_configuration_errors() {
    assert!(matches!(
        Coordinator::new(vec![], Connections::default(), Box::new(Jacobi), options()),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Coordinator::new(
            vec![Affine::spawn("a", 1.0, 0.0)],
            Connections::default().weak((SlaveId(0), OUTPUT), (SlaveId(3), INPUT)),
            Box::new(Jacobi),
            options()
        ),
        Err(Error::Config(_))
    ));
}

#[test_log::test]
fn test_state_count_mismatch_is_protocol_error() {
    let mut master = coordinator(
        vec![
            Affine::spawn("a", 1.0, 0.0),
            Misbehaving::spawn("liar", Fault::WrongStateCount),
        ],
        Connections::default(),
    );
    let err = master.prepare(0.0).unwrap_err();
    assert!(
        matches!(err, Error::Protocol { slave: SlaveId(1), .. }),
        "{err}"
    );
    assert!(err.is_fatal());
}

#[test_log::test]
fn test_crashed_slave_disconnects() {
    let mut master = coordinator(
        vec![
            Affine::spawn("a", 1.0, 0.0),
            Misbehaving::spawn("crash", Fault::PanicOnStep),
        ],
        Connections::default(),
    );
    master.prepare(0.0).unwrap();
    let err = master.run_iteration(0.0, 0.1).unwrap_err();
    assert!(
        matches!(err, Error::Disconnected { slave: SlaveId(1), .. }),
        "{err}"
    );
}

#[test_log::test]
fn test_slave_error_is_reported() {
    let mut master = coordinator(
        vec![Misbehaving::spawn("refuses", Fault::FailStep)],
        Connections::default(),
    );
    master.prepare(0.0).unwrap();
    let err = master.run_iteration(0.0, 0.1).unwrap_err();
    assert!(matches!(err, Error::Slave { .. }), "{err}");
    assert!(!err.is_fatal());
    assert_eq!(master.get_num_pending_requests(), 0);
}

#[test_log::test]
fn test_wait_timeout() {
    let mut master = Coordinator::new(
        vec![Misbehaving::spawn(
            "slow",
            Fault::SlowStep(Duration::from_millis(300)),
        )],
        Connections::default(),
        Box::new(Jacobi),
        MasterOptions {
            wait_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        },
    )
    .unwrap();
    master.prepare(0.0).unwrap();

    let err = master.run_iteration(0.0, 0.1).unwrap_err();
    assert!(matches!(err, Error::Timeout { pending: 1, .. }), "{err}");
}
