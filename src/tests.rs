//! End-to-end tests of the recalculation engine
use crate::{CellState, Computed, Engine, Error, Misuse, Signal, Transaction};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// Test fixture: a circuit whose derived values count their recomputations
struct TestCircuit {
    voltage: Arc<Signal<f64>>,
    current: Arc<Signal<f64>>,
    power: Arc<Computed<f64>>,
    power_runs: Arc<AtomicUsize>,
}

impl TestCircuit {
    fn new(engine: &Engine) -> Self {
        let voltage = Signal::new(engine, 12.0);
        let current = Signal::new(engine, 2.0);
        let power_runs = Arc::new(AtomicUsize::new(0));
        let power = Computed::lazy(engine, {
            let (voltage, current, runs) = (voltage.clone(), current.clone(), power_runs.clone());
            move || {
                runs.fetch_add(1, Ordering::Relaxed);
                Ok(voltage.get() * current.get())
            }
        });
        Self {
            voltage,
            current,
            power,
            power_runs,
        }
    }

    fn runs(&self) -> usize {
        self.power_runs.load(Ordering::Relaxed)
    }
}

fn counted<T, F>(engine: &Engine, runs: &Arc<AtomicUsize>, mut f: F) -> Arc<Computed<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut() -> crate::Result<T> + Send + 'static,
{
    let runs = runs.clone();
    Computed::lazy(engine, move || {
        runs.fetch_add(1, Ordering::Relaxed);
        f()
    })
}

#[test]
fn derived_value_follows_its_input() {
    let engine = Engine::new();
    let x = Signal::new(&engine, 2);
    let y = Computed::new(&engine, {
        let x = x.clone();
        move || Ok(x.get() * 10)
    })
    .unwrap();

    assert_eq!(y.get().unwrap(), 20);
    x.set(5);
    assert_eq!(y.get().unwrap(), 50);
}

#[test]
fn chain_of_derived_cells_is_not_a_cycle() {
    let engine = Engine::new();
    let a = Computed::new(&engine, || Ok(1)).unwrap();
    let b = Computed::new(&engine, {
        let a = a.clone();
        move || Ok(a.get()? + 1)
    })
    .unwrap();
    let c = Computed::new(&engine, {
        let b = b.clone();
        move || Ok(b.get()? + 1)
    })
    .unwrap();

    assert_eq!(c.get().unwrap(), 3);
    assert_eq!(c.dependencies(), vec![b.id()]);
    assert_eq!(a.dependents(), vec![b.id()]);
}

#[test]
fn mutual_recursion_is_a_cycle() {
    cov_mark::check!(cycle_detected);
    let engine = Engine::new();
    let a = Computed::<i32>::deferred(&engine);
    let b = Computed::lazy(&engine, {
        let a = Arc::downgrade(&a);
        move || a.upgrade().map_or(Ok(0), |a| a.get())
    });

    let err = a.define({
        let b = b.clone();
        move || b.get()
    });

    let err = err.unwrap_err();
    assert!(matches!(err, Error::CyclicDependency { cell } if cell == a.id()));
    assert_eq!(a.state(), CellState::Dirty);
    assert_eq!(b.state(), CellState::Dirty);
    assert_eq!(engine.depth(), 0);

    // Still a cycle on every later read
    assert_eq!(a.get().unwrap_err().cycle_cell(), Some(a.id()));
    assert_eq!(engine.depth(), 0);
}

#[test]
fn untaken_branch_is_not_a_dependency() {
    let engine = Engine::new();
    let flag = Signal::new(&engine, true);
    let x = Signal::new(&engine, 1);
    let y = Signal::new(&engine, 2);
    let runs = Arc::new(AtomicUsize::new(0));
    let l = counted(&engine, &runs, {
        let (flag, x, y) = (flag.clone(), x.clone(), y.clone());
        move || Ok(if flag.get() { x.get() } else { y.get() })
    });

    assert_eq!(l.get().unwrap(), 1);
    assert_eq!(l.dependencies(), vec![flag.id(), x.id()]);

    y.set(99);
    assert_eq!(l.state(), CellState::Current);

    flag.set(false);
    assert_eq!(l.get().unwrap(), 99);
    assert_eq!(runs.load(Ordering::Relaxed), 2);

    // The old branch no longer reaches l
    assert_eq!(l.dependencies(), vec![flag.id(), y.id()]);
    assert!(x.dependents().is_empty());
    x.set(7);
    assert!(l.is_current());
}

#[test]
fn nothing_runs_until_read() {
    let engine = Engine::new();
    let circuit = TestCircuit::new(&engine);
    assert_eq!(circuit.runs(), 0);

    circuit.voltage.set(10.0);
    circuit.current.set(3.0);
    assert_eq!(circuit.runs(), 0);

    assert_eq!(circuit.power.get().unwrap(), 30.0);
    assert_eq!(circuit.runs(), 1);
}

#[test]
fn reads_are_memoized_until_an_input_changes() {
    let engine = Engine::new();
    let circuit = TestCircuit::new(&engine);

    for _ in 0..5 {
        assert_eq!(circuit.power.get().unwrap(), 24.0);
    }
    assert_eq!(circuit.runs(), 1);

    // Writing the same value is not a change
    circuit.voltage.set(12.0);
    assert!(circuit.power.is_current());

    circuit.voltage.set(6.0);
    circuit.current.set(1.0);
    assert_eq!(circuit.power.get().unwrap(), 6.0);
    assert_eq!(circuit.runs(), 2);
}

#[test]
fn change_reaches_every_transitive_dependent_once() {
    let engine = Engine::new();
    let source = Signal::new(&engine, 1);
    let runs = Arc::new(AtomicUsize::new(0));

    // source -> left, right -> bottom -> top
    let left = counted(&engine, &runs, {
        let source = source.clone();
        move || Ok(source.get() + 1)
    });
    let right = counted(&engine, &runs, {
        let source = source.clone();
        move || Ok(source.get() * 2)
    });
    let bottom = counted(&engine, &runs, {
        let (left, right) = (left.clone(), right.clone());
        move || Ok(left.get()? + right.get()?)
    });
    let top = counted(&engine, &runs, {
        let bottom = bottom.clone();
        move || Ok(bottom.get()? * 10)
    });

    assert_eq!(top.get().unwrap(), 40);
    assert_eq!(runs.load(Ordering::Relaxed), 4);

    source.set(2);
    for cell in [&left, &right, &bottom, &top] {
        assert_eq!(cell.state(), CellState::Dirty);
    }

    assert_eq!(top.get().unwrap(), 70);
    assert_eq!(runs.load(Ordering::Relaxed), 8);
}

#[test]
fn unchanged_intermediate_value_still_recomputes_dirty_dependents() {
    let engine = Engine::new();
    let input = Signal::new(&engine, 2);
    let runs = Arc::new(AtomicUsize::new(0));
    let parity = counted(&engine, &runs, {
        let input = input.clone();
        move || Ok(input.get() % 2)
    });
    let label = counted(&engine, &runs, {
        let parity = parity.clone();
        move || Ok(if parity.get()? == 0 { "even" } else { "odd" })
    });

    assert_eq!(label.get().unwrap(), "even");
    input.set(4);
    assert_eq!(label.state(), CellState::Dirty);
    assert_eq!(label.get().unwrap(), "even");
    assert_eq!(runs.load(Ordering::Relaxed), 4);
}

#[test]
fn invalidate_is_idempotent() {
    let engine = Engine::new();
    let circuit = TestCircuit::new(&engine);
    let label_runs = Arc::new(AtomicUsize::new(0));
    let label = counted(&engine, &label_runs, {
        let power = circuit.power.clone();
        move || Ok(format!("{} W", power.get()?))
    });
    assert_eq!(label.get().unwrap(), "24 W");

    circuit.power.invalidate().unwrap();
    let first = circuit.power.get().unwrap();
    circuit.power.invalidate().unwrap();
    let second = circuit.power.get().unwrap();

    assert_eq!(first, second);
    assert_eq!(circuit.runs(), 3);
    assert!(label.is_current());
    assert_eq!(label_runs.load(Ordering::Relaxed), 1);
}

#[test]
fn invalidate_from_own_computation_is_a_cycle() {
    let engine = Engine::new();
    let cell = Computed::<i32>::deferred(&engine);
    let weak = Arc::downgrade(&cell);

    let err = cell
        .define(move || {
            if let Some(cell) = weak.upgrade() {
                cell.invalidate()?;
            }
            Ok(1)
        })
        .unwrap_err();

    assert_eq!(err.cycle_cell(), Some(cell.id()));
    assert_eq!(cell.state(), CellState::Dirty);
}

#[test]
fn failed_computation_leaves_cell_dirty_and_retries() {
    let engine = Engine::new();
    let text = Signal::new(&engine, String::from("5"));
    let parsed = Computed::new(&engine, {
        let text = text.clone();
        move || text.with(|t| t.parse::<i32>()).map_err(Error::computation)
    })
    .unwrap();
    assert_eq!(parsed.get().unwrap(), 5);

    text.set("five".to_string());
    let err = parsed.get().unwrap_err();
    assert!(matches!(err, Error::Computation(_)));
    assert_eq!(parsed.state(), CellState::Dirty);
    assert!(parsed.dependencies().is_empty());
    assert_eq!(engine.depth(), 0);

    // Still dirty, so the next read retries
    assert!(parsed.get().is_err());

    text.set("6".to_string());
    assert_eq!(parsed.get().unwrap(), 6);
    assert!(parsed.is_current());
    assert_eq!(parsed.dependencies(), vec![text.id()]);
}

#[test]
fn swallowed_failed_read_keeps_reader_dirty() {
    cov_mark::check!(settled_dirty_after_failed_read);
    let engine = Engine::new();
    let input = Signal::new(&engine, 1);
    let checked = Computed::lazy(&engine, {
        let input = input.clone();
        move || match input.get() {
            n if n < 0 => Err(Error::computation("negative input")),
            n => Ok(n),
        }
    });
    let runs = Arc::new(AtomicUsize::new(0));
    let fallback = counted(&engine, &runs, {
        let checked = checked.clone();
        move || Ok(checked.get().unwrap_or(-1))
    });
    assert_eq!(fallback.get().unwrap(), 1);

    input.set(-3);
    assert_eq!(fallback.get().unwrap(), -1);
    assert_eq!(fallback.state(), CellState::Dirty);

    // Retried on the next read
    assert_eq!(fallback.get().unwrap(), -1);
    assert_eq!(runs.load(Ordering::Relaxed), 3);

    // Reading a cell that stayed dirty does not make the reader current
    let shown = Computed::lazy(&engine, {
        let fallback = fallback.clone();
        move || Ok(fallback.get()? * 10)
    });
    assert_eq!(shown.get().unwrap(), -10);
    assert_eq!(shown.state(), CellState::Dirty);

    input.set(2);
    assert_eq!(shown.get().unwrap(), 20);
    assert_eq!(fallback.get().unwrap(), 2);
    assert!(fallback.is_current());
    assert!(shown.is_current());
}

#[test]
fn change_below_dirty_settled_cell_reaches_readers_above_it() {
    let engine = Engine::new();
    let gate = Signal::new(&engine, false);
    let leaf = Signal::new(&engine, 1);
    let failing = Computed::lazy(&engine, {
        let gate = gate.clone();
        move || {
            if gate.get() {
                Ok(100)
            } else {
                Err(Error::computation("gate closed"))
            }
        }
    });
    // leaf, failing -> mid -> top -> outer
    let mid = Computed::lazy(&engine, {
        let (leaf, failing) = (leaf.clone(), failing.clone());
        move || Ok(leaf.get() + failing.get().unwrap_or(0))
    });
    let top = Computed::lazy(&engine, {
        let mid = mid.clone();
        move || Ok(mid.get()? * 10)
    });
    let outer = Computed::lazy(&engine, {
        let top = top.clone();
        move || Ok(top.get()? + 1)
    });

    assert_eq!(outer.get().unwrap(), 11);
    for cell in [&mid, &top, &outer] {
        assert_eq!(cell.state(), CellState::Dirty);
    }

    leaf.set(5);
    assert_eq!(top.get().unwrap(), 50);
    assert_eq!(outer.get().unwrap(), 51);
    assert_eq!(mid.get().unwrap(), 5);

    gate.set(true);
    assert_eq!(outer.get().unwrap(), 1051);
    for cell in [&mid, &top, &outer] {
        assert!(cell.is_current());
    }

    // Fully settled again, so ordinary propagation takes over
    leaf.set(6);
    for cell in [&mid, &top, &outer] {
        assert_eq!(cell.state(), CellState::Dirty);
    }
    assert_eq!(outer.get().unwrap(), 1061);
}

#[test]
fn engine_survives_panicking_computation() {
    let engine = Engine::new();
    let input = Signal::new(&engine, 0);
    let halved = Computed::new(&engine, {
        let input = input.clone();
        move || {
            let n = input.get();
            assert!(n % 2 == 0, "odd input {n}");
            Ok(n / 2)
        }
    })
    .unwrap();

    input.set(3);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| halved.get()));
    assert!(result.is_err());
    assert_eq!(halved.state(), CellState::Dirty);
    assert_eq!(engine.depth(), 0);
    assert!(!engine.is_tracking());

    input.set(8);
    assert_eq!(halved.get().unwrap(), 4);
}

#[test]
fn dropping_a_derived_cell_unsubscribes_it() {
    let engine = Engine::new();
    let source = Signal::new(&engine, 1);
    let doubled = Computed::new(&engine, {
        let source = source.clone();
        move || Ok(source.get() * 2)
    })
    .unwrap();
    assert_eq!(source.dependents(), vec![doubled.id()]);
    assert_eq!(engine.cell_count(), 2);

    drop(doubled);
    assert!(source.dependents().is_empty());
    assert_eq!(engine.cell_count(), 1);
    assert!(source.set(2));
}

#[test]
fn dropped_source_leaves_dependent_value_cached() {
    let engine = Engine::new();
    let source = Signal::new(&engine, 4);
    let squared = Computed::new(&engine, {
        let source = Arc::downgrade(&source);
        move || Ok(source.upgrade().map_or(0, |s| s.get() * s.get()))
    })
    .unwrap();

    drop(source);
    assert!(squared.dependencies().is_empty());
    assert!(squared.is_current());
    assert_eq!(squared.get().unwrap(), 16);
}

#[test]
fn engines_do_not_see_each_others_reads() {
    let engine = Engine::new();
    let other = Engine::new();
    let foreign = Signal::new(&other, 3);
    let saw_tracking = Arc::new(AtomicBool::new(true));

    let local = Computed::new(&engine, {
        let (foreign, other, saw) = (foreign.clone(), other.clone(), saw_tracking.clone());
        move || {
            saw.store(other.is_tracking(), Ordering::Relaxed);
            Ok(foreign.get() + 1)
        }
    })
    .unwrap();

    assert!(!saw_tracking.load(Ordering::Relaxed));
    assert!(local.dependencies().is_empty());
    assert!(foreign.dependents().is_empty());

    foreign.set(10);
    assert!(local.is_current());
    assert_eq!(local.get().unwrap(), 4);
}

#[test]
fn deferred_cell_reports_misuse_until_defined() {
    let engine = Engine::new();
    let cell = Computed::<u8>::deferred(&engine);
    let reader = Computed::lazy(&engine, {
        let cell = cell.clone();
        move || cell.get()
    });

    let err = reader.get().unwrap_err();
    assert_eq!(err.to_string(), format!("{} was read before its computation was defined", cell.id()));
    assert!(matches!(err, Error::Misuse(Misuse::Undefined(id)) if id == cell.id()));

    cell.define(|| Ok(9)).unwrap();
    assert_eq!(reader.get().unwrap(), 9);
}

#[test]
fn transaction_delivers_latest_value_once() {
    let engine = Engine::new();
    let circuit = TestCircuit::new(&engine);
    circuit.power.get().unwrap();

    let signal_seen = Arc::new(Mutex::new(Vec::new()));
    let power_seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = signal_seen.clone();
        circuit.voltage.subscribe_silent(move |v| seen.lock().push(*v));
        let seen = power_seen.clone();
        circuit.power.subscribe_silent(move |v| seen.lock().push(*v));
    }

    Transaction::run(&engine, || {
        circuit.voltage.set(1.0);
        circuit.voltage.set(2.0);
        // Reads inside the transaction already see the new value
        assert_eq!(circuit.power.get().unwrap(), 4.0);
        circuit.current.set(5.0);
        assert_eq!(circuit.power.get().unwrap(), 10.0);
        assert!(signal_seen.lock().is_empty());
        assert!(power_seen.lock().is_empty());
    });

    assert_eq!(*signal_seen.lock(), vec![2.0]);
    assert_eq!(*power_seen.lock(), vec![10.0]);
}

#[test]
fn delivery_for_cell_dropped_in_transaction_is_discarded() {
    let engine = Engine::new();
    let signal = Signal::new(&engine, 0);
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    signal.subscribe_silent(move |_| {
        calls_clone.fetch_add(1, Ordering::Relaxed);
    });

    Transaction::run(&engine, move || {
        signal.set(1);
        drop(signal);
    });

    assert_eq!(calls.load(Ordering::Relaxed), 0);
    assert_eq!(engine.cell_count(), 0);
}

#[test]
fn subscribing_to_failing_cell_fails() {
    let engine = Engine::new();
    let broken = Computed::<i32>::lazy(&engine, || Err(Error::computation("offline")));
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    let result = broken.subscribe(move |_| {
        calls_clone.fetch_add(1, Ordering::Relaxed);
    });

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::Relaxed), 0);
    // The read was untracked and left nothing behind
    assert_eq!(engine.depth(), 0);
}

#[test]
fn threads_share_one_engine_consistently() {
    let engine = Engine::new();
    let base = Signal::new(&engine, 0_i64);
    let doubled = Computed::new(&engine, {
        let base = base.clone();
        move || Ok(base.get() * 2)
    })
    .unwrap();

    std::thread::scope(|scope| {
        for worker in 0..4_i64 {
            let (engine, base, doubled) = (engine.clone(), base.clone(), doubled.clone());
            scope.spawn(move || {
                for i in 0..200 {
                    base.set(worker * 1000 + i);
                    let (b, d) = Transaction::run(&engine, || (base.get(), doubled.get()));
                    assert_eq!(d.unwrap(), b * 2);
                }
            });
        }
    });

    assert_eq!(doubled.get().unwrap(), base.get() * 2);
    assert_eq!(engine.depth(), 0);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn direct(a: i32, b: i32, c: i32) -> i32 {
        if a > 0 { (a + b) * c } else { b - c }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn derived_value_matches_direct_evaluation(
            writes in prop::collection::vec((0_usize..3, -4_i32..5, any::<bool>()), 1..40),
        ) {
            let engine = Engine::new();
            let leaves = [
                Signal::new(&engine, 1),
                Signal::new(&engine, 2),
                Signal::new(&engine, 3),
            ];
            let [a, b, c] = leaves.clone();
            let sum = Computed::lazy(&engine, {
                let (a, b) = (a.clone(), b.clone());
                move || Ok(a.get() + b.get())
            });
            let result = Computed::lazy(&engine, {
                let (a, b, c, sum) = (a.clone(), b.clone(), c.clone(), sum.clone());
                move || Ok(if a.get() > 0 { sum.get()? * c.get() } else { b.get() - c.get() })
            });

            for (leaf, value, read) in writes {
                leaves[leaf].set(value);
                if read {
                    let expected = direct(a.get(), b.get(), c.get());
                    prop_assert_eq!(result.get().unwrap(), expected);
                }
            }
            prop_assert_eq!(result.get().unwrap(), direct(a.get(), b.get(), c.get()));
            prop_assert_eq!(engine.depth(), 0);
        }
    }
}
