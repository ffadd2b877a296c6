//! End-to-end engine scenarios
//!
//! These tests drive the public manager surface the way an embedder would:
//! load a config document, spawn entities, tick, and observe state through
//! queries and events.

use std::sync::Arc;

use vivarium::config::ConfigDocument;
use vivarium::core::ManualClock;
use vivarium::engine::EntityManager;
use vivarium::events::EventKind;

fn manager_with(doc: &str) -> (EntityManager, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let mut mgr = EntityManager::with_seed(1234);
    mgr.set_clock(clock.clone());
    mgr.load_config(ConfigDocument::from_json_str(doc).unwrap()).unwrap();
    (mgr, clock)
}

// ============================================================================
// Threshold traits on a depleting variable
// ============================================================================

const HUNGER_DOC: &str = r#"{"id":"creatures","nodes":[
    {"id":"hunger","kind":"variable","min":0,"max":100,"initial":60,
     "baseRate":-10,"changeMode":"timed","direction":"deplete"},
    {"id":"mood","kind":"layer","timing":{"rollAt":"never"}},
    {"id":"grumpy","kind":"trait","layerId":"mood",
     "selection":{"trigger":{"target":"hunger","operator":"<=","value":20},
                  "autoRemove":{"target":"hunger","operator":">=","value":40}}},
    {"id":"mod_starving","kind":"modifier"},
    {"id":"hangry","kind":"compound","requires":["mod_starving","grumpy"],
     "requirementLogic":"all"}
]}"#;

#[test]
fn test_depletion_triggers_threshold_trait() {
    let (mut mgr, _) = manager_with(HUNGER_DOC);
    let id = mgr.generate(None).unwrap();

    assert!(mgr.tick(id, Some(5.0)));
    let entity = mgr.get_state(id).unwrap();
    assert_eq!(entity.variables["hunger"].value, 10.0);
    assert_eq!(entity.layers["mood"].active, ["grumpy"]);

    mgr.set_variable(id, "hunger", 50.0);
    assert!(!mgr.get_state(id).unwrap().has_trait("grumpy"));
}

#[test]
fn test_compound_emerges_and_dissolves() {
    let (mut mgr, _) = manager_with(HUNGER_DOC);
    let id = mgr.generate(None).unwrap();

    mgr.tick(id, Some(5.0));
    assert!(mgr.get_state(id).unwrap().has_trait("grumpy"));
    assert!(!mgr.get_state(id).unwrap().has_compound("hangry"));

    mgr.apply_modifier(id, "mod_starving", None);
    assert!(mgr.get_state(id).unwrap().has_compound("hangry"));

    mgr.remove_modifier(id, "mod_starving");
    assert!(!mgr.get_state(id).unwrap().has_compound("hangry"));
}

#[test]
fn test_variable_stays_in_bounds_through_any_mutation() {
    let (mut mgr, _) = manager_with(HUNGER_DOC);
    let id = mgr.generate(None).unwrap();

    for _ in 0..30 {
        mgr.tick(id, Some(3.0));
    }
    let value = mgr.get_state(id).unwrap().variables["hunger"].value;
    assert!((0.0..=100.0).contains(&value));

    mgr.modify_variable(id, "hunger", 1e9);
    assert_eq!(mgr.get_state(id).unwrap().variables["hunger"].value, 100.0);
    mgr.modify_variable(id, "hunger", -1e9);
    assert_eq!(mgr.get_state(id).unwrap().variables["hunger"].value, 0.0);
}

// ============================================================================
// Exclusive modifier specificity
// ============================================================================

const WOUNDS_DOC: &str = r#"{"nodes":[
    {"id":"hp","kind":"variable","min":0,"max":100,"initial":100},
    {"id":"lightly_wounded","kind":"modifier","exclusiveWith":["wounded","critical"],
     "trigger":{"type":"threshold","target":"hp","operator":"<=","value":80}},
    {"id":"wounded","kind":"modifier","exclusiveWith":["lightly_wounded","critical"],
     "trigger":{"type":"threshold","target":"hp","operator":"<=","value":50}},
    {"id":"critical","kind":"modifier","exclusiveWith":["lightly_wounded","wounded"],
     "trigger":{"type":"threshold","target":"hp","operator":"<=","value":20}}
]}"#;

#[test]
fn test_most_specific_exclusive_modifier_wins() {
    let (mut mgr, _) = manager_with(WOUNDS_DOC);
    let id = mgr.generate(None).unwrap();

    mgr.set_variable(id, "hp", 15.0);
    assert_eq!(mgr.get_state(id).unwrap().modifiers, ["critical"]);

    mgr.set_variable(id, "hp", 45.0);
    assert_eq!(mgr.get_state(id).unwrap().modifiers, ["wounded"]);

    mgr.set_variable(id, "hp", 90.0);
    assert!(mgr.get_state(id).unwrap().modifiers.is_empty());
}

#[test]
fn test_exclusive_group_never_doubles_up() {
    let (mut mgr, _) = manager_with(WOUNDS_DOC);
    let id = mgr.generate(None).unwrap();

    // Sweep hp across every band; at most one group member may be active
    for hp in [100.0, 75.0, 40.0, 10.0, 60.0, 85.0, 5.0] {
        mgr.set_variable(id, "hp", hp);
        let entity = mgr.get_state(id).unwrap();
        assert!(entity.modifiers.len() <= 1, "hp {hp}: {:?}", entity.modifiers);
    }
}

// ============================================================================
// Cascade batching
// ============================================================================

#[test]
fn test_threshold_sweep_batches_to_one_cascade() {
    // Two non-exclusive threshold modifiers apply in one sweep; the rate
    // fold must run once and still pick up both contributions.
    let (mut mgr, _) = manager_with(
        r#"{"nodes":[
            {"id":"heat","kind":"variable","min":0,"max":100,"initial":0,"baseRate":1},
            {"id":"burning","kind":"modifier",
             "trigger":{"type":"threshold","target":"heat","operator":">=","value":50}},
            {"id":"smoking","kind":"modifier",
             "trigger":{"type":"threshold","target":"heat","operator":">=","value":40}}
        ],
        "relationships":[
            {"sourceId":"burning","targetId":"heat","type":"rate_modifier",
             "config":{"operation":"add","value":2}},
            {"sourceId":"smoking","targetId":"heat","type":"rate_modifier",
             "config":{"operation":"add","value":3}}
        ]}"#,
    );
    let id = mgr.generate(None).unwrap();

    let runs_before = mgr.cascade_runs();
    mgr.set_variable(id, "heat", 60.0);
    let entity = mgr.get_state(id).unwrap();
    assert_eq!(entity.modifiers.len(), 2);
    assert_eq!(entity.variables["heat"].current_rate, 6.0, "base 1 + 2 + 3");
    assert_eq!(mgr.cascade_runs() - runs_before, 1, "one flush for the whole mutation");
}

#[test]
fn test_modifier_round_trip_restores_rates() {
    let (mut mgr, _) = manager_with(
        r#"{"nodes":[
            {"id":"stamina","kind":"variable","min":0,"max":100,"initial":100,"baseRate":-1},
            {"id":"haste","kind":"modifier"}
        ],
        "relationships":[
            {"sourceId":"haste","targetId":"stamina","type":"rate_modifier",
             "config":{"operation":"add","value":-3}}
        ]}"#,
    );
    let id = mgr.generate(None).unwrap();
    let before = mgr.get_state(id).unwrap().variables["stamina"].current_rate;

    mgr.apply_modifier(id, "haste", None);
    assert_eq!(mgr.get_state(id).unwrap().variables["stamina"].current_rate, -4.0);

    mgr.remove_modifier(id, "haste");
    assert_eq!(mgr.get_state(id).unwrap().variables["stamina"].current_rate, before);
}

#[test]
fn test_cascade_is_idempotent() {
    let (mut mgr, _) = manager_with(HUNGER_DOC);
    let id = mgr.generate(None).unwrap();
    mgr.tick(id, Some(5.0));
    mgr.apply_modifier(id, "mod_starving", None);

    let normalize = |mgr: &EntityManager| {
        let mut entity = mgr.get_state(id).unwrap().clone();
        entity.log.clear();
        entity.last_tick = 0;
        serde_json::to_value(&entity).unwrap()
    };

    let first = normalize(&mgr);
    // A zero-length tick re-runs the cascade machinery with no new writes
    mgr.tick(id, Some(0.0));
    let second = normalize(&mgr);
    assert_eq!(first, second);
}

// ============================================================================
// Derived values
// ============================================================================

#[test]
fn test_derived_recomputes_on_dependency_change() {
    let (mut mgr, _) = manager_with(
        r#"{"nodes":[
            {"id":"strength","kind":"attribute","min":0,"max":20,"defaultRange":[10,10]},
            {"id":"stamina","kind":"variable","min":0,"max":100,"initial":50},
            {"id":"might","kind":"derived","formula":"strength * 2 + stamina / 10",
             "min":0,"max":999}
        ]}"#,
    );
    let id = mgr.generate(None).unwrap();
    assert_eq!(mgr.get_state(id).unwrap().derived["might"], 25.0);

    mgr.set_variable(id, "stamina", 90.0);
    assert_eq!(mgr.get_state(id).unwrap().derived["might"], 29.0);
}

// ============================================================================
// Weighted selection through the public surface
// ============================================================================

#[test]
fn test_diminishing_returns_weight_preview() {
    let (mut mgr, _) = manager_with(
        r#"{"nodes":[
            {"id":"mood","kind":"layer","timing":{"rollAt":"never"},
             "selection":{"diminishingReturns":true}},
            {"id":"bold","kind":"trait","layerId":"mood","selection":{"baseWeight":16}},
            {"id":"srcA","kind":"modifier"},
            {"id":"srcB","kind":"modifier"}
        ],
        "relationships":[
            {"sourceId":"srcA","targetId":"bold","type":"weight_influence",
             "config":{"operation":"add","value":9}},
            {"sourceId":"srcB","targetId":"bold","type":"weight_influence",
             "config":{"operation":"add","value":9}}
        ]}"#,
    );
    let id = mgr.generate(None).unwrap();
    mgr.apply_modifier(id, "srcA", None);
    mgr.apply_modifier(id, "srcB", None);

    let weights = mgr.get_weights(id, "mood");
    assert_eq!(weights.len(), 1);
    assert_eq!(weights[0].weight, 40.0, "16 + 2 * (sqrt(9) * sqrt(16))");
}

#[test]
fn test_incompatibility_invariant_holds_after_rolls() {
    let (mut mgr, _) = manager_with(
        r#"{"nodes":[
            {"id":"mood","kind":"layer","timing":{"rollAt":"spawn"},
             "selection":{"initialRolls":2}},
            {"id":"cheerful","kind":"trait","layerId":"mood"},
            {"id":"grumpy","kind":"trait","layerId":"mood","incompatibleWith":["cheerful"]},
            {"id":"stoic","kind":"trait","layerId":"mood"}
        ]}"#,
    );
    for _ in 0..20 {
        let id = mgr.generate(None).unwrap();
        let entity = mgr.get_state(id).unwrap();
        let active = &entity.layers["mood"].active;
        assert!(
            !(active.contains(&"cheerful".to_string()) && active.contains(&"grumpy".to_string())),
            "incompatible traits active together: {active:?}"
        );
    }
}

// ============================================================================
// Events and history
// ============================================================================

#[test]
fn test_event_stream_for_lifecycle() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let (mut mgr, _) = manager_with(HUNGER_DOC);
    let seen = Rc::new(RefCell::new(Vec::new()));

    for kind in [EventKind::EntitySpawned, EventKind::TraitActivated, EventKind::CompoundActivated] {
        let log = seen.clone();
        mgr.on(kind, move |event| log.borrow_mut().push(event.kind()));
    }

    let id = mgr.generate(None).unwrap();
    mgr.tick(id, Some(5.0));
    mgr.apply_modifier(id, "mod_starving", None);

    let kinds = seen.borrow();
    assert!(kinds.contains(&EventKind::EntitySpawned));
    assert!(kinds.contains(&EventKind::TraitActivated));
    assert!(kinds.contains(&EventKind::CompoundActivated));
}

#[test]
fn test_rollback_restores_fields_and_recomputes_rates() {
    let (mut mgr, clock) = manager_with(
        r#"{"nodes":[
            {"id":"stamina","kind":"variable","min":0,"max":100,"initial":80,"baseRate":-1},
            {"id":"haste","kind":"modifier"},
            {"id":"speed","kind":"derived","formula":"stamina / 2","min":0,"max":50}
        ],
        "relationships":[
            {"sourceId":"haste","targetId":"stamina","type":"rate_modifier",
             "config":{"operation":"add","value":-5}}
        ]}"#,
    );
    let id = mgr.generate(None).unwrap();

    clock.advance(1_000);
    mgr.snapshot(id);

    clock.advance(1_000);
    mgr.apply_modifier(id, "haste", None);
    mgr.set_variable(id, "stamina", 10.0);
    assert_eq!(mgr.get_state(id).unwrap().variables["stamina"].current_rate, -6.0);

    assert!(mgr.rollback(id, 1_500));
    let entity = mgr.get_state(id).unwrap();
    assert_eq!(entity.variables["stamina"].value, 80.0);
    assert!(entity.modifiers.is_empty());
    assert_eq!(entity.derived["speed"], 40.0);
    // Rates come from a fresh cascade over the restored state
    assert_eq!(entity.variables["stamina"].current_rate, -1.0);
}

#[test]
fn test_groups_and_query() {
    let (mut mgr, _) = manager_with(HUNGER_DOC);
    let a = mgr.generate(None).unwrap();
    let b = mgr.generate(None).unwrap();

    assert!(mgr.create_group("pack"));
    assert!(mgr.add_to_group("pack", a));
    assert_eq!(mgr.get_group("pack"), Some(&[a][..]));

    // The synthetic config group holds everything spawned from this config
    let config_group = mgr.get_group("config:creatures").unwrap();
    assert!(config_group.contains(&a) && config_group.contains(&b));

    assert!(mgr.remove_from_group("pack", a));
    assert!(mgr.delete_group("pack"));
    assert!(mgr.get_group("pack").is_none());
}
