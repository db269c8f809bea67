use waiter_scheduler::k8s::names::shorten;

const SERVICE_ID: &str = "waiter-myapp-e8b625cc83c411e8974c38d5474b213d";

#[test]
fn test_short_budget_preserves_hash_ends() {
    // 32-char budget minus the pod suffix leaves room for first-8 + last-8
    assert_eq!(shorten(SERVICE_ID, 32, 5), "myapp-e8b625cc474b213d");
}

#[test]
fn test_wide_budget_preserves_whole_hash() {
    let name = shorten(SERVICE_ID, 64, 5);
    assert!(name.contains("e8b625cc83c411e8974c38d5474b213d"));
    assert_eq!(name, "myapp-e8b625cc83c411e8974c38d5474b213d");
}

#[test]
fn test_length_bound_holds_across_budgets() {
    let ids = [
        SERVICE_ID,
        "waiter-kitchen-0123456789abcdef0123456789abcdef",
        "prod-waiter-averyveryverylongname-fedcba9876543210fedcba9876543210",
        "unhashed-service-name",
    ];
    for id in ids {
        for (max, suffix) in [(24, 5), (32, 5), (48, 5), (63, 5), (64, 8)] {
            let name = shorten(id, max, suffix);
            assert!(
                name.len() <= max - suffix - 1,
                "{name:?} over budget for id={id} max={max} suffix={suffix}"
            );
            assert_eq!(name, shorten(id, max, suffix), "must be deterministic");
        }
    }
}
