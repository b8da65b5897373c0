use wdfuzz_model::testing::{mock_packet, MockDissectorFactory};
use wdfuzz_model::{
    Direction, DissectorFactory, ExcludeMask, ExcludeRuleConfig, ExclusionEngine, ModelError,
};

fn rule(filter: &str, apply_to: &str) -> ExcludeRuleConfig {
    ExcludeRuleConfig {
        description: String::new(),
        filter: filter.into(),
        apply_to: apply_to.into(),
    }
}

#[test]
fn test_matching_masks_are_ored() {
    let factory = MockDissectorFactory::new();
    let engine = ExclusionEngine::new(
        &factory,
        &[
            rule("rrc.type==setup", "M"),
            rule("rrc", "D"),
            rule("nas.msg", "S"),
        ],
    )
    .unwrap();
    let mut d = factory.create();
    engine.prepare(d.as_mut());

    let tree = d.dissect(&mock_packet(&[("rrc", "1"), ("rrc.type", "setup")]), Direction::Tx);
    let mask = engine.evaluate(d.as_ref(), &tree);
    assert_eq!(mask, ExcludeMask::MUTATION | ExcludeMask::DUPLICATION);
    assert!(!mask.forbids(ExcludeMask::MAPPING));
}

#[test]
fn test_removing_a_rule_only_clears_bits() {
    let factory = MockDissectorFactory::new();
    let configs = vec![
        rule("rrc.type==setup", "M"),
        rule("rrc.type", "DV"),
        rule("rrc.type==release", "A"),
    ];
    let mut d = factory.create();
    let tree = d.dissect(&mock_packet(&[("rrc.type", "setup")]), Direction::Rx);

    let full = ExclusionEngine::new(&factory, &configs)
        .unwrap()
        .evaluate(d.as_ref(), &tree);
    for skip in 0..configs.len() {
        let subset: Vec<_> = configs
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .map(|(_, c)| c.clone())
            .collect();
        let partial = ExclusionEngine::new(&factory, &subset)
            .unwrap()
            .evaluate(d.as_ref(), &tree);
        assert!(full.contains(partial), "rule {skip} removal set new bits");
    }
}

#[test]
fn test_no_match_is_empty() {
    let factory = MockDissectorFactory::new();
    let engine = ExclusionEngine::new(&factory, &[rule("nas.msg", "A")]).unwrap();
    let mut d = factory.create();
    let tree = d.dissect(b"rrc.type=setup", Direction::Rx);
    assert!(engine.evaluate(d.as_ref(), &tree).is_empty());
}

#[test]
fn test_evaluation_is_repeatable() {
    let factory = MockDissectorFactory::new();
    let engine = ExclusionEngine::new(&factory, &[rule("rrc.type", "R")]).unwrap();
    let mut d = factory.create();
    let tree = d.dissect(b"rrc.type=setup", Direction::Rx);
    let first = engine.evaluate(d.as_ref(), &tree);
    assert_eq!(first, engine.evaluate(d.as_ref(), &tree));
    assert_eq!(first, ExcludeMask::RETRY);
}

#[test]
fn test_bad_exclusion_filter_is_fatal() {
    let factory = MockDissectorFactory::new();
    match ExclusionEngine::new(&factory, &[rule("a and (b)", "M")]) {
        Err(ModelError::FilterCompile { expr, .. }) => assert_eq!(expr, "a and (b)"),
        other => panic!("expected FilterCompile, got {other:?}"),
    }
}
