//! DSL safety: anything outside the allow-listed grammar is rejected when
//! the rule set loads, never at evaluation time.

use fdp_config::VelocityRegistry;
use fdp_rules::CompiledRuleSet;
use fdp_schemas::{ActionHint, Rule, RuleSetDoc, Severity};
use serde_json::json;

fn doc_with_condition(condition: &str) -> RuleSetDoc {
    RuleSetDoc {
        rules: vec![Rule {
            rule_id: "rule_probe".into(),
            version: 1,
            enabled: true,
            priority: 10,
            condition: condition.into(),
            score: 0.5,
            action_hint: ActionHint::Review,
            severity: Severity::Warn,
            metadata: json!({}),
        }],
    }
}

fn compiles(condition: &str) -> bool {
    CompiledRuleSet::compile(
        &doc_with_condition(condition),
        &VelocityRegistry::default_registry(),
    )
    .is_ok()
}

#[test]
fn the_documented_grammar_compiles() {
    for good in [
        "amount > 500",
        "amount >= 500 AND is_night",
        "NOT is_international OR amount <= 10",
        "merchant_country IN [\"RU\", \"IR\"]",
        "channel IN high_risk_channels",
        "velocity_1h('count') > 2",
        "velocity_24h('amount') > 5000",
        "member_of('deny', 'ip')",
        "(amount > 100 AND is_night) OR aml_flag",
        "auth_method == '3ds'",
        "has_initial_2fa == true",
        "currency != \"EUR\"",
    ] {
        assert!(compiles(good), "should accept {good:?}");
    }
}

#[test]
fn code_execution_shapes_are_rejected_at_load() {
    for bad in [
        // assignment
        "amount = 500",
        // attribute access
        "merchant.country == \"RU\"",
        // indexing
        "rule_hits[0] == \"x\"",
        // statement separators / comments
        "amount > 1; aml_flag",
        "amount > 1 # note",
        // arithmetic is not part of the grammar
        "amount + 1 > 2",
        // arbitrary callables
        "__import__('os')",
        "exec('rm -rf /')",
        "eval('1')",
        "system('id')",
        // non-string call arguments
        "velocity_1h(amount) > 2",
        "member_of(deny, ip)",
        // unterminated constructs
        "velocity_1h('count'",
        "(amount > 1",
        "'open string",
    ] {
        assert!(!compiles(bad), "should reject {bad:?}");
    }
}

#[test]
fn rejection_reports_the_offending_rule() {
    let err = CompiledRuleSet::compile(
        &doc_with_condition("x := 1"),
        &VelocityRegistry::default_registry(),
    )
    .unwrap_err();
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].rule_id, "rule_probe");
}
