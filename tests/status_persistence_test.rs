//! Status variables surviving deactivation and instance replacement.

use daq_module::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Window {
    x: i32,
    y: i32,
}

struct Viewer {
    count: u32,
    window: Window,
    zoom: f64,
    refuse_shutdown: bool,
}

impl Module for Viewer {
    const BASE: ModuleBase = ModuleBase::Gui;

    fn schema() -> &'static ModuleSchema<Self> {
        static SCHEMA: Lazy<ModuleSchema<Viewer>> = Lazy::new(|| {
            ModuleSchema::builder()
                .option(ConfigOption::new("refuse_shutdown", json!(false)))
                .status_var(StatusVar::new("count", json!(0), |m: &mut Viewer| &mut m.count))
                // Stored as "x,y" text.
                .status_var(
                    StatusVar::new("window", json!("0,0"), |m: &mut Viewer| &mut m.window)
                        .with_constructor(|_, value| {
                            let text = value.as_str().unwrap_or_default().to_string();
                            let (x, y) = text
                                .split_once(',')
                                .ok_or_else(|| anyhow::anyhow!("bad window '{}'", text))?;
                            Ok(Window {
                                x: x.trim().parse()?,
                                y: y.trim().parse()?,
                            })
                        })
                        .with_representer(|_, w| Ok(json!(format!("{},{}", w.x, w.y)))),
                )
                .status_var(
                    StatusVar::new("zoom", json!(1.0), |m: &mut Viewer| &mut m.zoom)
                        .with_representer(|_, zoom| {
                            if zoom.is_finite() {
                                Ok(json!(zoom))
                            } else {
                                anyhow::bail!("zoom is not finite")
                            }
                        }),
                )
                .build()
        });
        &SCHEMA
    }

    fn create(ctx: &ModuleContext) -> anyhow::Result<Self> {
        Ok(Viewer {
            count: 0,
            window: Window { x: -1, y: -1 },
            zoom: 0.0,
            refuse_shutdown: ctx.option_as("refuse_shutdown")?,
        })
    }

    fn on_activate(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        self.count += 1;
        Ok(())
    }

    fn on_deactivate(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        if self.refuse_shutdown {
            anyhow::bail!("camera still streaming");
        }
        Ok(())
    }
}

fn viewer(status: Map<String, Value>) -> ModuleCore<Viewer> {
    ModuleBuilder::new(Arc::new(HeadlessManager), "viewer")
        .status_variables(status)
        .build()
        .unwrap()
}

#[test]
fn status_round_trips_through_a_fresh_instance() {
    let mut first = viewer(Map::new());
    first.activate().unwrap();
    first.module_mut().window = Window { x: 120, y: 40 };
    first.module_mut().zoom = 2.5;
    first.deactivate().unwrap();

    let saved = first.status_variables();
    assert_eq!(saved["count"], json!(1));
    assert_eq!(saved["window"], json!("120,40"));
    assert_eq!(saved["zoom"], json!(2.5));
    drop(first);

    let mut second = viewer(saved);
    second.activate().unwrap();
    assert_eq!(second.module().count, 2);
    assert_eq!(second.module().window, Window { x: 120, y: 40 });
    assert_eq!(second.module().zoom, 2.5);
}

#[test]
fn defaults_apply_when_nothing_was_persisted() {
    let mut core = viewer(Map::new());
    core.activate().unwrap();
    assert_eq!(core.module().count, 1);
    assert_eq!(core.module().window, Window { x: 0, y: 0 });
    assert_eq!(core.module().zoom, 1.0);
}

#[test]
fn representer_and_constructor_are_stable_across_cycles() {
    let mut core = viewer(Map::new());
    core.activate().unwrap();
    core.module_mut().window = Window { x: -3, y: 7 };
    core.deactivate().unwrap();
    let after_first = core.status_variables();

    for _ in 0..3 {
        core.activate().unwrap();
        core.module_mut().count -= 1;
        core.deactivate().unwrap();
        assert_eq!(core.status_variables(), after_first);
    }
}

#[test]
fn failing_representer_skips_only_that_variable() {
    let mut core = viewer(Map::new());
    core.activate().unwrap();
    core.module_mut().zoom = f64::NAN;
    core.module_mut().window = Window { x: 5, y: 6 };

    assert!(core.deactivate().unwrap().is_committed());
    let saved = core.status_variables();
    assert_eq!(saved["window"], json!("5,6"));
    assert!(!saved.contains_key("zoom"));
}

#[test]
fn failing_deactivation_still_persists_status() {
    let mut core = ModuleBuilder::<Viewer>::new(Arc::new(HeadlessManager), "viewer")
        .config(Map::from_iter([("refuse_shutdown".to_string(), json!(true))]))
        .build()
        .unwrap();
    core.activate().unwrap();
    core.module_mut().window = Window { x: 1, y: 2 };

    let outcome = core.deactivate().unwrap();
    assert!(!outcome.is_committed());
    assert!(outcome
        .failure()
        .unwrap()
        .to_string()
        .contains("camera still streaming"));
    assert_eq!(core.current_state(), ModuleState::Idle);
    assert_eq!(core.status_variables()["window"], json!("1,2"));
}

#[test]
fn bad_persisted_value_fails_activation_without_state_change() {
    let mut core = viewer(Map::from_iter([("window".to_string(), json!("wide"))]));
    let outcome = core.activate().unwrap();
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.event, LifecycleEvent::Activate);
    assert!(failure.trace.contains("window"));
    assert_eq!(core.current_state(), ModuleState::Deactivated);
}

#[test]
fn status_can_be_saved_without_deactivating() {
    let mut core = viewer(Map::new());
    core.activate().unwrap();
    core.module_mut().count = 9;
    core.dump_status_variables();
    assert_eq!(core.status_variables()["count"], json!(9));
    assert_eq!(core.current_state(), ModuleState::Idle);
}

#[test]
fn whole_store_replacement_requires_a_mapping() {
    let mut core = viewer(Map::new());
    core.set_status_variables(json!({"count": 41})).unwrap();
    assert!(matches!(
        core.set_status_variables(json!(41)),
        Err(ModuleError::InvalidStatusVariables { .. })
    ));

    core.activate().unwrap();
    assert_eq!(core.module().count, 42);

    // Snapshots are copies.
    let mut snapshot = core.status_variables();
    snapshot.insert("count".into(), json!(0));
    assert_eq!(core.status_variables()["count"], json!(41));
}
