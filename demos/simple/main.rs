use std::sync::Arc;

use feats::{
    AppConfig, Definition, Entity, FeatureState, Implementation, InputType, Rollout, Value,
    Weights,
};

pub fn main() -> feats::Result<()> {
    env_logger::init();

    let app = AppConfig::memory().to_app()?;

    // Label users by their plan attribute.
    let plan = app.segment(
        "billing.Plan",
        Definition::builder()
            .implementation(
                Implementation::builder("plan")
                    .input(InputType::Entity("user".into()))
                    .func(|args: &[Value]| {
                        args[0]
                            .as_entity()
                            .and_then(|user| user.attribute("plan"))
                            .map_or_else(|| "free".to_owned(), |plan| plan.to_string())
                    }),
            )
            .build()?,
    )?;

    let user_key = app.segment(
        "billing.UserKey",
        Definition::builder()
            .implementation(
                Implementation::builder("key")
                    .input(InputType::AnyEntity)
                    .func(|args: &[Value]| match args[0].as_entity() {
                        Some(user) => user.key.to_string(),
                        None => String::new(),
                    }),
            )
            .build()?,
    )?;

    let checkout = app.feature(
        "billing.Checkout",
        Definition::builder()
            .description("Checkout flow shown to a user")
            .implementation(
                Implementation::builder("legacy")
                    .input(InputType::Entity("user".into()))
                    .default()
                    .func(|_: &[Value]| "legacy checkout"),
            )
            .implementation(
                Implementation::builder("one_click")
                    .input(InputType::Entity("user".into()))
                    .func(|_: &[Value]| "one-click checkout"),
            )
            .build()?,
    )?;

    // Roll one-click checkout out to a quarter of the premium plan.
    let rollout = Rollout::new(
        "Premium one-click rollout",
        user_key,
        Weights::new().with("one_click", 1).with("legacy", 3),
    )?;
    let state = FeatureState::initial("demo")
        .with_segments(vec![plan])
        .map_selector(Some(vec!["premium".into()]), Arc::new(rollout))?;
    checkout.set_state(&state)?;

    for (key, plan) in [("1", "premium"), ("2", "free"), ("3", "premium")] {
        let user = Value::from(Entity::new("user", key).with_attribute("plan", plan));
        println!("user {key} ({plan}): {}", checkout.create(&[user])?);
    }

    Ok(())
}
