use std::{collections::BTreeMap, fmt};

use crate::{
    definition::{Definition, Implementation, ImplementationBuilder, DEFAULT_TAG},
    value::InputType,
    Error, Result, Str, Value,
};

/// A decision point with interchangeable implementations and exactly one default.
///
/// All implementations take the same inputs, so any of them can be swapped in for a given call.
pub struct Feature<O> {
    definition: Definition<O>,
    input_types: Vec<InputType>,
    default_implementation: Str,
}

impl<O> Clone for Feature<O> {
    fn clone(&self) -> Self {
        Feature {
            definition: self.definition.clone(),
            input_types: self.input_types.clone(),
            default_implementation: self.default_implementation.clone(),
        }
    }
}

impl<O> fmt::Debug for Feature<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature")
            .field("input_types", &self.input_types)
            .field("default_implementation", &self.default_implementation)
            .field("definition", &self.definition)
            .finish()
    }
}

impl<O> Feature<O> {
    /// Validate that `definition` forms a feature: every implementation declares the same inputs
    /// and exactly one of them is tagged [`DEFAULT_TAG`].
    pub fn new(definition: Definition<O>) -> Result<Feature<O>> {
        let mut problems = Vec::new();

        let input_types = definition
            .implementations()
            .values()
            .next()
            .map(|implementation| implementation.input_types().to_vec())
            .unwrap_or_default();
        let mismatched = definition
            .implementations()
            .values()
            .any(|implementation| implementation.input_types() != input_types.as_slice());
        if mismatched {
            let offending: Vec<String> = definition
                .implementations()
                .values()
                .map(|i| format!("{}({})", i.name(), join_types(i.input_types())))
                .collect();
            problems.push(format!("inputs must match: {}", offending.join(", ")));
        }

        let defaults: Vec<&Str> = definition
            .tagged(DEFAULT_TAG)
            .map(Implementation::name)
            .collect();
        match defaults.as_slice() {
            [] => problems.push("must specify a default".to_owned()),
            [_] => {}
            many => problems.push(format!(
                "must specify only one default, found {}",
                many.iter()
                    .map(|name| name.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }

        if !problems.is_empty() {
            return Err(Error::InvalidFeature { problems });
        }

        let default_implementation = defaults[0].clone();
        Ok(Feature {
            definition,
            input_types,
            default_implementation,
        })
    }

    /// Inputs shared by every implementation.
    pub fn input_types(&self) -> &[InputType] {
        &self.input_types
    }

    /// The implementation tagged [`DEFAULT_TAG`].
    pub fn default_implementation(&self) -> &Implementation<O> {
        &self.definition.implementations()[&self.default_implementation]
    }

    /// Implementations by name.
    pub fn implementations(&self) -> &BTreeMap<Str, Implementation<O>> {
        self.definition.implementations()
    }

    /// The implementation called `name`, if any.
    pub fn get(&self, name: &str) -> Option<&Implementation<O>> {
        self.definition.get(name)
    }

    /// Description of the underlying definition.
    pub fn description(&self) -> Option<&Str> {
        self.definition.description()
    }

    /// The definition this feature was validated from.
    pub fn definition(&self) -> &Definition<O> {
        &self.definition
    }
}

impl Definition<bool> {
    /// Wrap a single predicate into a three-way toggle: `Enabled` always returns `true`,
    /// `Disabled` always returns `false` and `Default` runs the predicate itself.
    ///
    /// Tags on `predicate` (including the default tag) move to the `Default` implementation.
    ///
    /// ```
    /// # use feats::{Definition, Feature, Implementation, Value};
    /// let definition = Definition::boolean(
    ///     Implementation::builder("new_checkout").default().func(|_: &[Value]| false),
    /// )
    /// .unwrap();
    /// let feature = Feature::new(definition).unwrap();
    /// assert_eq!(feature.default_implementation().name(), "Default");
    /// ```
    pub fn boolean(predicate: ImplementationBuilder<bool>) -> Result<Definition<bool>> {
        let ImplementationBuilder {
            name,
            input_types,
            description,
            tags,
            func,
        } = predicate;

        let mut default = Implementation::builder("Default")
            .inputs(input_types.clone())
            .description(description.unwrap_or_else(|| format!("Uses {name}").into()));
        default.tags = tags;
        default.func = func;

        Definition::builder()
            .description(format!("Toggle for {name}"))
            .implementation(
                Implementation::builder("Enabled")
                    .inputs(input_types.clone())
                    .description("Always enabled")
                    .func(|_: &[Value]| true),
            )
            .implementation(default)
            .implementation(
                Implementation::builder("Disabled")
                    .inputs(input_types)
                    .description("Always disabled")
                    .func(|_: &[Value]| false),
            )
            .build()
    }
}

pub(crate) fn join_types(types: &[InputType]) -> String {
    types
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::Feature;
    use crate::{
        definition::{Definition, Implementation, ImplementationBuilder},
        value::InputType,
        Error, Value,
    };

    fn greeting(name: &'static str) -> ImplementationBuilder<String> {
        Implementation::builder(name)
            .input(InputType::String)
            .func(move |args: &[Value]| format!("{name} {}", args[0]))
    }

    fn problems(result: crate::Result<Feature<String>>) -> Vec<String> {
        match result {
            Err(Error::InvalidFeature { problems }) => problems,
            other => panic!("expected InvalidFeature, got {:?}", other),
        }
    }

    #[test]
    fn exposes_default_and_inputs() {
        let feature = Feature::new(
            Definition::builder()
                .description("greets people")
                .implementation(greeting("hello").default())
                .implementation(greeting("hi"))
                .build()
                .unwrap(),
        )
        .unwrap();

        assert_eq!(feature.default_implementation().name(), "hello");
        assert_eq!(feature.input_types(), &[InputType::String]);
        assert_eq!(feature.implementations().len(), 2);
        assert_eq!(feature.description().unwrap(), "greets people");
        assert_eq!(
            feature.default_implementation().call(&["bob".into()]),
            "hello bob"
        );
    }

    #[test]
    fn requires_a_default() {
        let result = Feature::new(
            Definition::builder()
                .implementation(greeting("hello"))
                .build()
                .unwrap(),
        );
        assert_eq!(problems(result), vec!["must specify a default".to_owned()]);
    }

    #[test]
    fn requires_only_one_default() {
        let result = Feature::new(
            Definition::builder()
                .implementation(greeting("hello").default())
                .implementation(greeting("hi").default())
                .build()
                .unwrap(),
        );
        let problems = problems(result);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("must specify only one default"));
    }

    #[test]
    fn inputs_must_match() {
        let result = Feature::new(
            Definition::builder()
                .implementation(greeting("hello").default())
                .implementation(
                    Implementation::builder("count")
                        .input(InputType::Integer)
                        .func(|_: &[Value]| String::new()),
                )
                .build()
                .unwrap(),
        );
        let problems = problems(result);
        assert!(problems[0].starts_with("inputs must match"), "{:?}", problems);
        assert!(problems[0].contains("count(int)"));
    }

    #[test]
    fn arity_must_match_and_problems_are_collected() {
        let result = Feature::new(
            Definition::builder()
                .implementation(greeting("hello"))
                .implementation(
                    Implementation::builder("pair")
                        .inputs([InputType::String, InputType::String])
                        .func(|_: &[Value]| String::new()),
                )
                .build()
                .unwrap(),
        );
        assert_eq!(problems(result).len(), 2);
    }

    #[test]
    fn boolean_forwards_default_tag() {
        let feature = Feature::new(
            Definition::boolean(
                Implementation::builder("is_beta_user")
                    .input(InputType::String)
                    .default()
                    .func(|args: &[Value]| args[0].as_str() == Some("beta")),
            )
            .unwrap(),
        )
        .unwrap();

        let names: Vec<&str> = feature.implementations().keys().map(|k| &**k).collect();
        assert_eq!(names, vec!["Default", "Disabled", "Enabled"]);
        assert_eq!(feature.default_implementation().name(), "Default");
        assert!(feature.default_implementation().call(&["beta".into()]));
        assert!(!feature.default_implementation().call(&["alpha".into()]));
        assert!(feature.get("Enabled").unwrap().call(&["alpha".into()]));
        assert!(!feature.get("Disabled").unwrap().call(&["beta".into()]));
        assert_eq!(feature.input_types(), &[InputType::String]);
    }

    #[test]
    fn boolean_without_default_tag_is_rejected() {
        let definition =
            Definition::boolean(Implementation::builder("check").func(|_: &[Value]| true)).unwrap();
        assert!(matches!(
            Feature::new(definition),
            Err(Error::InvalidFeature { .. })
        ));
    }
}
