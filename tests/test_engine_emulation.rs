// Drives the callback table the way DL-FIND does, from a Rust closure standing
// in for the engine.

use dlfind::callbacks::{Callbacks, Evaluation, MultistateEvaluation};
use dlfind::contracts::CallbackTable;
use dlfind::engine::{RunBuilder, RunError, RunParameters};
use dlfind::params::{DlfParams, ParamSlots, ParamValue, ParamsError, FIELDS};
use dlfind::trajectory::Trajectory;
use nalgebra::{DMatrix, Matrix3xX};

const FLOAT_SENTINEL: f64 = -999.25;
const INT_SENTINEL: i32 = -777;

struct EngineState {
    slots: ParamSlots,
    coords: Vec<f64>,
    coords2: Vec<f64>,
    spec: Vec<i32>,
}

/// What the engine does first: ask for its configuration.
fn request_params(parameters: &RunParameters, table: &CallbackTable) -> EngineState {
    let [nvar, nvar2, nspec, _] = parameters.to_c().unwrap();
    let mut state = EngineState {
        slots: ParamSlots::filled(FLOAT_SENTINEL, INT_SENTINEL),
        coords: vec![FLOAT_SENTINEL; parameters.nvar],
        coords2: vec![FLOAT_SENTINEL; parameters.nvar2],
        spec: vec![INT_SENTINEL; parameters.nspec],
    };
    unsafe {
        state.slots.invoke(
            table.get_params,
            nvar,
            nvar2,
            nspec,
            &mut state.coords,
            &mut state.coords2,
            &mut state.spec,
        );
    }
    state
}

fn call_gradient(table: &CallbackTable, coords: &[f64]) -> (f64, Vec<f64>, i32) {
    let mut energy = FLOAT_SENTINEL;
    let mut gradient = vec![FLOAT_SENTINEL; coords.len()];
    let mut status = INT_SENTINEL;
    unsafe {
        (table.get_gradient)(
            coords.len() as i32,
            coords.as_ptr(),
            &mut energy,
            gradient.as_mut_ptr(),
            0,
            1,
            &mut status,
        );
    }
    (energy, gradient, status)
}

#[test]
fn test_single_atom_gradient_round_trip() {
    let params = DlfParams::new(vec![[0.0, 0.0, 0.0]]);
    let callbacks = Callbacks::new().gradient(|coords, _, _| Evaluation {
        energy: 1.5,
        gradient: Matrix3xX::zeros(coords.ncols()),
    });
    let prepared = RunBuilder::new(params).callbacks(callbacks).prepare().unwrap();

    let mut observed = None;
    let mut engine = |parameters: &RunParameters, table: &CallbackTable| {
        let state = request_params(parameters, table);
        observed = Some(call_gradient(table, &state.coords));
    };
    let summary = prepared.run(&mut engine).unwrap();

    let (energy, gradient, status) = observed.unwrap();
    assert_eq!(energy, 1.5);
    assert_eq!(gradient, vec![0.0; 3]);
    assert_eq!(status, 0);
    assert_eq!(summary.stats.params, 1);
    assert_eq!(summary.stats.gradient, 1);
    assert_eq!(summary.parameters.nvar, 3);
    assert_eq!(summary.parameters.nspec, 2);
}

#[test]
fn test_get_params_writes_only_supplied_values() {
    let params = DlfParams::new(vec![[0.0, 0.1, 0.2], [1.0, 1.1, 1.2]])
        .coords2(vec![5.0, 6.0])
        .spec(vec![1, 1, 0, 0])
        .iopt(3)
        .tolerance(1.0e-4);
    let prepared = RunBuilder::new(params)
        .callbacks(Callbacks::new().gradient(|coords, _, _| Evaluation {
            energy: 0.0,
            gradient: Matrix3xX::zeros(coords.ncols()),
        }))
        .prepare()
        .unwrap();

    let mut captured = None;
    prepared
        .run(&mut |parameters: &RunParameters, table: &CallbackTable| {
            captured = Some(request_params(parameters, table));
        })
        .unwrap();
    let state = captured.unwrap();

    assert_eq!(state.coords, vec![0.0, 0.1, 0.2, 1.0, 1.1, 1.2]);
    assert_eq!(state.coords2, vec![5.0, 6.0]);
    assert_eq!(state.spec, vec![1, 1, 0, 0]);
    assert_eq!(state.slots.ierr, 0);
    assert_eq!(state.slots.iopt, 3);
    assert_eq!(state.slots.tolerance, 1.0e-4);

    for field in FIELDS {
        if matches!(field.name, "iopt" | "tolerance") {
            continue;
        }
        match state.slots.get(field.name).unwrap() {
            ParamValue::Int(v) => assert_eq!(v, INT_SENTINEL, "{}", field.name),
            ParamValue::Float(v) => assert_eq!(v, FLOAT_SENTINEL, "{}", field.name),
        }
    }
}

#[test]
fn test_classification_length_mismatch_fails_before_engine() {
    let prepared = RunBuilder::new(DlfParams::new(vec![[0.0; 3], [1.0; 3]]).spec(vec![0; 4]))
        .callbacks(Callbacks::new().gradient(|coords, _, _| Evaluation {
            energy: 0.0,
            gradient: Matrix3xX::zeros(coords.ncols()),
        }))
        .classification_len(5)
        .prepare();
    assert!(matches!(
        prepared,
        Err(RunError::Params(ParamsError::LengthMismatch {
            field: "spec",
            expected: 5,
            actual: 4
        }))
    ));
}

#[test]
fn test_multistate_coupling_follows_request_flag() {
    let mut coupling_requests = Vec::new();
    let callbacks = Callbacks::new().multistate(|coords, need_coupling, _| {
        coupling_requests.push(need_coupling);
        let n = coords.ncols();
        MultistateEvaluation {
            energies: [-1.0, -0.5],
            gradients: [
                Matrix3xX::from_element(n, 0.25),
                Matrix3xX::from_element(n, -0.25),
            ],
            coupling: None,
        }
    });
    let prepared = RunBuilder::new(DlfParams::new(vec![[0.0; 3], [1.0; 3]]))
        .callbacks(callbacks)
        .prepare()
        .unwrap();

    let mut results = Vec::new();
    prepared
        .run(&mut |parameters: &RunParameters, table: &CallbackTable| {
            let state = request_params(parameters, table);
            let nvar = state.coords.len();
            for flag in [0, 1] {
                let mut energy = [FLOAT_SENTINEL; 2];
                let mut gradient = vec![FLOAT_SENTINEL; 2 * nvar];
                let mut coupling = vec![FLOAT_SENTINEL; nvar];
                let mut status = INT_SENTINEL;
                unsafe {
                    (table.get_multistate_gradients)(
                        nvar as i32,
                        state.coords.as_ptr(),
                        energy.as_mut_ptr(),
                        gradient.as_mut_ptr(),
                        coupling.as_mut_ptr(),
                        flag,
                        0,
                        &mut status,
                    );
                }
                results.push((energy, gradient, coupling, status));
            }
        })
        .unwrap();

    assert_eq!(coupling_requests, vec![false, true]);

    let (energy, gradient, coupling, status) = &results[0];
    assert_eq!(*energy, [-1.0, -0.5]);
    assert_eq!(gradient[..6].to_vec(), vec![0.25; 6]);
    assert_eq!(gradient[6..].to_vec(), vec![-0.25; 6]);
    assert_eq!(*coupling, vec![FLOAT_SENTINEL; 6]);
    assert_eq!(*status, 0);

    let (_, _, coupling, status) = &results[1];
    assert_eq!(*coupling, vec![0.0; 6]);
    assert_eq!(*status, 0);
}

#[test]
fn test_host_coupling_is_written_row_major() {
    let callbacks = Callbacks::new().multistate(|coords, _, _| {
        let n = coords.ncols();
        MultistateEvaluation {
            energies: [0.0, 0.0],
            gradients: [Matrix3xX::zeros(n), Matrix3xX::zeros(n)],
            coupling: Some(Matrix3xX::from_fn(n, |i, j| (10 * j + i) as f64)),
        }
    });
    let prepared = RunBuilder::new(DlfParams::new(vec![[0.0; 3], [1.0; 3]]))
        .callbacks(callbacks)
        .prepare()
        .unwrap();

    let mut coupling = vec![FLOAT_SENTINEL; 6];
    prepared
        .run(&mut |parameters: &RunParameters, table: &CallbackTable| {
            let state = request_params(parameters, table);
            let mut energy = [0.0; 2];
            let mut gradient = [0.0; 12];
            let mut status = 1;
            unsafe {
                (table.get_multistate_gradients)(
                    6,
                    state.coords.as_ptr(),
                    energy.as_mut_ptr(),
                    gradient.as_mut_ptr(),
                    coupling.as_mut_ptr(),
                    1,
                    0,
                    &mut status,
                );
            }
        })
        .unwrap();

    assert_eq!(coupling, vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
}

#[test]
fn test_hessian_is_written_column_major() {
    let callbacks = Callbacks::new()
        .gradient(|coords, _, _| Evaluation {
            energy: 0.0,
            gradient: Matrix3xX::zeros(coords.ncols()),
        })
        .hessian(|coords| {
            let n = 3 * coords.ncols();
            DMatrix::from_fn(n, n, |i, j| (10 * i + j) as f64)
        });
    let prepared = RunBuilder::new(DlfParams::new(vec![[0.0; 3]]))
        .callbacks(callbacks)
        .prepare()
        .unwrap();

    let mut hessian = vec![FLOAT_SENTINEL; 9];
    let mut status = INT_SENTINEL;
    let summary = prepared
        .run(&mut |parameters: &RunParameters, table: &CallbackTable| {
            let state = request_params(parameters, table);
            unsafe {
                (table.get_hessian)(3, state.coords.as_ptr(), hessian.as_mut_ptr(), &mut status);
            }
        })
        .unwrap();

    for i in 0..3 {
        for j in 0..3 {
            assert_eq!(hessian[i + 3 * j], (10 * i + j) as f64);
        }
    }
    assert_eq!(status, 0);
    assert_eq!(summary.stats.hessian, 1);
}

#[test]
fn test_unregistered_slots_skip_host_but_count_notifications() {
    let prepared = RunBuilder::new(DlfParams::new(vec![[0.0; 3]]))
        .callbacks(Callbacks::new().gradient(|coords, _, _| Evaluation {
            energy: 0.0,
            gradient: Matrix3xX::zeros(coords.ncols()),
        }))
        .prepare()
        .unwrap();

    let mut hessian = [FLOAT_SENTINEL; 9];
    let mut status = INT_SENTINEL;
    let summary = prepared
        .run(&mut |parameters: &RunParameters, table: &CallbackTable| {
            let state = request_params(parameters, table);
            unsafe {
                (table.get_hessian)(3, state.coords.as_ptr(), hessian.as_mut_ptr(), &mut status);
                (table.put_coords)(3, 1, -2.0, state.coords.as_ptr(), 1);
                (table.update)();
                (table.error)();
            }
        })
        .unwrap();

    assert_eq!(hessian, [FLOAT_SENTINEL; 9]);
    assert_eq!(status, INT_SENTINEL);
    assert_eq!(summary.stats.hessian, 0);
    assert_eq!(summary.stats.put_coords, 1);
    assert_eq!(summary.stats.update, 1);
    assert_eq!(summary.stats.error, 1);
    assert_eq!(summary.stats.total(), 4);
}

#[test]
fn test_notifications_reach_host_hooks() {
    let mut updates = 0;
    let mut errors = 0;
    let callbacks = Callbacks::new()
        .gradient(|coords, _, _| Evaluation {
            energy: 0.0,
            gradient: Matrix3xX::zeros(coords.ncols()),
        })
        .on_update(|| updates += 1)
        .on_error(|| errors += 1);
    let prepared = RunBuilder::new(DlfParams::new(vec![[0.0; 3]]))
        .callbacks(callbacks)
        .prepare()
        .unwrap();

    let summary = prepared
        .run(&mut |_: &RunParameters, table: &CallbackTable| unsafe {
            (table.update)();
            (table.update)();
            (table.error)();
        })
        .unwrap();

    assert_eq!((updates, errors), (2, 1));
    assert_eq!(summary.stats.update, 2);
    assert_eq!(summary.stats.error, 1);
    assert_eq!(summary.stats.params, 0);
}

#[test]
fn test_nested_run_is_refused() {
    fn quiet<'a>() -> Callbacks<'a> {
        Callbacks::new().gradient(|coords, _, _| Evaluation {
            energy: 0.0,
            gradient: Matrix3xX::zeros(coords.ncols()),
        })
    }

    let outer = RunBuilder::new(DlfParams::new(vec![[0.0; 3]]))
        .callbacks(quiet())
        .prepare()
        .unwrap();
    let inner = RunBuilder::new(DlfParams::new(vec![[0.0; 3]]))
        .callbacks(quiet())
        .prepare()
        .unwrap();

    let mut inner = Some(inner);
    let mut nested = None;
    outer
        .run(&mut |_: &RunParameters, _: &CallbackTable| {
            if let Some(inner) = inner.take() {
                nested = Some(inner.run(&mut |_: &RunParameters, _: &CallbackTable| {}));
            }
        })
        .unwrap();

    assert!(matches!(nested, Some(Err(RunError::AlreadyRunning))));

    // The thread is free again afterwards.
    let again = RunBuilder::new(DlfParams::new(vec![[0.0; 3]]))
        .callbacks(quiet())
        .prepare()
        .unwrap();
    assert!(again.run(&mut |_: &RunParameters, _: &CallbackTable| {}).is_ok());
}

#[test]
fn test_steepest_descent_run_records_trajectory() {
    let target = Matrix3xX::from_column_slice(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.74]);
    let params = DlfParams::standard(vec![[0.3, -0.2, 0.1], [0.5, 0.4, 1.6]])
        .tolerance(1.0e-6)
        .maxcycle(200);

    let mut trajectory = Trajectory::new();
    let callbacks = Callbacks::new()
        .gradient(|coords, _, _| {
            let diff = coords - &target;
            Evaluation {
                energy: diff.norm_squared(),
                gradient: diff * 2.0,
            }
        })
        .put_coords(|report| trajectory.record(report));
    let prepared = RunBuilder::new(params).callbacks(callbacks).prepare().unwrap();

    let mut cycles = 0;
    let summary = prepared
        .run(&mut |parameters: &RunParameters, table: &CallbackTable| {
            let state = request_params(parameters, table);
            let tolerance = state.slots.tolerance;
            let mut coords = state.coords;
            for _ in 0..state.slots.maxcycle {
                cycles += 1;
                let (energy, gradient, status) = call_gradient(table, &coords);
                assert_eq!(status, 0);
                unsafe {
                    (table.put_coords)(coords.len() as i32, 1, energy, coords.as_ptr(), 1);
                }
                if gradient.iter().all(|g| g.abs() < tolerance) {
                    break;
                }
                for (x, g) in coords.iter_mut().zip(&gradient) {
                    *x -= 0.25 * g;
                }
            }
        })
        .unwrap();

    assert!(cycles > 1 && cycles < 200);
    assert_eq!(summary.stats.gradient, cycles);
    assert_eq!(summary.stats.put_coords, cycles);
    assert_eq!(trajectory.len(), cycles);

    let first = &trajectory.frames()[0];
    assert_eq!(first.coords, vec![[0.3, -0.2, 0.1], [0.5, 0.4, 1.6]]);

    let last = trajectory.last().unwrap();
    assert!(last.energy < 1.0e-10);
    assert!((last.coords[1][2] - 0.74).abs() < 1.0e-6);
    assert!(trajectory.frames().windows(2).all(|w| w[1].energy <= w[0].energy));
    assert!(trajectory.with_switch(1).count() == cycles);
}
