use promo_core::{
    DeploymentPolicyId, DistributionConfig, InMemoryControl, ResourceIdentifier, UpdateRequest,
    UpdateStep,
};
use promo_kernel::{BackoffConfig, ExecutionContext, RetryPolicy, Transition, UpdateState};
use proptest::prelude::*;
use serde_json::Value;

fn any_field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9.-]{0,16}".prop_map(Value::from),
    ]
}

fn any_config() -> impl Strategy<Value = DistributionConfig> {
    (
        "[a-z][a-z0-9-]{0,12}",
        proptest::option::of("[a-z0-9-]{1,12}"),
        proptest::collection::btree_map("[a-z_]{1,10}", any_field_value(), 0..6),
    )
        .prop_map(|(id, policy, fields)| {
            let mut config = DistributionConfig::new(ResourceIdentifier::new(id));
            config.deployment_policy_id = policy.map(DeploymentPolicyId::new);
            config.fields = fields
                .into_iter()
                .filter(|(k, _)| k != "id" && k != "deployment_policy_id")
                .collect();
            config
        })
}

proptest! {
    #[test]
    fn prop_merge_overwrites_only_the_policy(config in any_config(), policy in "[a-z0-9-]{1,12}") {
        let policy = DeploymentPolicyId::new(policy);
        let merged = config.merge_policy(&policy);

        prop_assert_eq!(&merged.id, &config.id);
        prop_assert_eq!(&merged.fields, &config.fields);
        prop_assert_eq!(merged.deployment_policy_id, Some(policy));
    }

    #[test]
    fn prop_merge_is_idempotent(config in any_config(), policy in "[a-z0-9-]{1,12}") {
        let policy = DeploymentPolicyId::new(policy);
        let once = config.merge_policy(&policy);
        prop_assert_eq!(once.merge_policy(&policy), once);
    }

    #[test]
    fn prop_update_step_satisfies_merge_contract(config in any_config(), policy in "[a-z0-9-]{1,12}") {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let control = InMemoryControl::new();
        control.insert(config.clone());
        let retry = RetryPolicy::new(BackoffConfig::immediate(1));
        let request = UpdateRequest {
            primary_id: config.id.clone(),
            deployment_policy_id: DeploymentPolicyId::new(policy.clone()),
            context: ExecutionContext::new("123456789012", "us-east-1"),
        };
        let quiet = |_: &Transition<UpdateState>| {};

        let (first, second) = runtime.block_on(async {
            let step = UpdateStep::new(&control, &retry);
            let first = step.run(&request, &quiet).await.unwrap();
            let second = step.run(&request, &quiet).await.unwrap();
            (first, second)
        });

        let live = control.current(&config.id).unwrap().config;
        prop_assert_eq!(&live, &config.merge_policy(&DeploymentPolicyId::new(policy)));
        prop_assert_eq!(&first.config, &second.config);
        prop_assert!(!second.changed);
    }
}
