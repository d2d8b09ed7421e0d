//! Explicit registration records for feature and segment implementations.
//!
//! A [`Definition`] is the raw material both [`Feature`](crate::Feature) and
//! [`Segment`](crate::Segment) are validated from. Every implementation is declared with its name,
//! ordered input types and tags; the output type is the Rust type parameter `O`.
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    sync::Arc,
};

use crate::{value::InputType, Error, Result, Str, Value};

/// Tag marking the implementation a feature falls back to when nothing else is configured.
pub const DEFAULT_TAG: &str = "default";

pub(crate) type Func<O> = Arc<dyn Fn(&[Value]) -> O + Send + Sync>;

/// One concrete variant of a feature or a segment. Immutable once built.
pub struct Implementation<O> {
    name: Str,
    input_types: Vec<InputType>,
    description: Option<Str>,
    tags: BTreeSet<Str>,
    func: Func<O>,
}

impl<O> Clone for Implementation<O> {
    fn clone(&self) -> Self {
        Implementation {
            name: self.name.clone(),
            input_types: self.input_types.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            func: Arc::clone(&self.func),
        }
    }
}

impl<O> fmt::Debug for Implementation<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementation")
            .field("name", &self.name)
            .field("input_types", &self.input_types)
            .field("output_type", &self.output_type())
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl<O> Implementation<O> {
    /// Start declaring an implementation called `name`.
    ///
    /// ```
    /// # use feats::{Implementation, InputType, Value};
    /// let upper = Implementation::builder("upper")
    ///     .input(InputType::String)
    ///     .func(|args: &[Value]| args[0].to_string().to_uppercase());
    /// ```
    pub fn builder(name: impl Into<Str>) -> ImplementationBuilder<O> {
        ImplementationBuilder {
            name: name.into(),
            input_types: Vec::new(),
            description: None,
            tags: BTreeSet::new(),
            func: None,
        }
    }

    /// Name selectors refer to this implementation by.
    pub fn name(&self) -> &Str {
        &self.name
    }

    /// Declared types of the positional arguments.
    pub fn input_types(&self) -> &[InputType] {
        &self.input_types
    }

    /// Name of the Rust type this implementation returns.
    pub fn output_type(&self) -> &'static str {
        std::any::type_name::<O>()
    }

    /// Free-form description.
    pub fn description(&self) -> Option<&Str> {
        self.description.as_ref()
    }

    /// Tags, including [`DEFAULT_TAG`] on the default implementation.
    pub fn tags(&self) -> &BTreeSet<Str> {
        &self.tags
    }

    /// Returns `true` if tagged [`DEFAULT_TAG`].
    pub fn is_default(&self) -> bool {
        self.tags.contains(DEFAULT_TAG)
    }

    /// Check `args` against the declared input types.
    pub fn check_arguments(&self, args: &[Value]) -> Result<()> {
        let matches = args.len() == self.input_types.len()
            && self
                .input_types
                .iter()
                .zip(args)
                .all(|(declared, arg)| declared.accepts(&arg.input_type()));
        if matches {
            Ok(())
        } else {
            Err(Error::InvalidArguments {
                expected: self.input_types.clone(),
                found: args.iter().map(Value::input_type).collect(),
            })
        }
    }

    /// Invoke the implementation. Arguments are not checked, see [`Implementation::check_arguments`].
    pub fn call(&self, args: &[Value]) -> O {
        (self.func)(args)
    }
}

/// Builder for [`Implementation`]. Problems are reported by [`DefinitionBuilder::build`].
pub struct ImplementationBuilder<O> {
    pub(crate) name: Str,
    pub(crate) input_types: Vec<InputType>,
    pub(crate) description: Option<Str>,
    pub(crate) tags: BTreeSet<Str>,
    pub(crate) func: Option<Func<O>>,
}

impl<O> ImplementationBuilder<O> {
    /// Append a declared input type. Call once per positional argument.
    pub fn input(mut self, input_type: InputType) -> Self {
        self.input_types.push(input_type);
        self
    }

    /// Append several declared input types.
    pub fn inputs(mut self, input_types: impl IntoIterator<Item = InputType>) -> Self {
        self.input_types.extend(input_types);
        self
    }

    /// Set the free-form description.
    pub fn description(mut self, description: impl Into<Str>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark this implementation as the feature default.
    pub fn default(self) -> Self {
        self.tag(DEFAULT_TAG)
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<Str>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// The function called on evaluation. Required.
    pub fn func(mut self, func: impl Fn(&[Value]) -> O + Send + Sync + 'static) -> Self {
        self.func = Some(Arc::new(func));
        self
    }

    fn build(self) -> std::result::Result<Implementation<O>, String> {
        if self.name.is_empty() {
            return Err("implementation name must not be empty".to_owned());
        }
        let Some(func) = self.func else {
            return Err(format!("implementation {:?} has no function", self.name));
        };
        Ok(Implementation {
            name: self.name,
            input_types: self.input_types,
            description: self.description,
            tags: self.tags,
            func,
        })
    }
}

/// A named set of implementations plus an index from tag to the implementations carrying it.
pub struct Definition<O> {
    description: Option<Str>,
    implementations: BTreeMap<Str, Implementation<O>>,
    annotations: BTreeMap<Str, Vec<Str>>,
}

impl<O> Clone for Definition<O> {
    fn clone(&self) -> Self {
        Definition {
            description: self.description.clone(),
            implementations: self.implementations.clone(),
            annotations: self.annotations.clone(),
        }
    }
}

impl<O> fmt::Debug for Definition<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("description", &self.description)
            .field("implementations", &self.implementations)
            .field("annotations", &self.annotations)
            .finish()
    }
}

impl<O> Definition<O> {
    /// Start an empty definition.
    pub fn builder() -> DefinitionBuilder<O> {
        DefinitionBuilder {
            description: None,
            implementations: Vec::new(),
        }
    }

    /// Free-form description.
    pub fn description(&self) -> Option<&Str> {
        self.description.as_ref()
    }

    /// Implementations by name.
    pub fn implementations(&self) -> &BTreeMap<Str, Implementation<O>> {
        &self.implementations
    }

    /// The implementation called `name`, if any.
    pub fn get(&self, name: &str) -> Option<&Implementation<O>> {
        self.implementations.get(name)
    }

    /// Implementations carrying `tag`, in declaration order.
    pub fn tagged(&self, tag: &str) -> impl Iterator<Item = &Implementation<O>> {
        self.annotations
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|name| self.implementations.get(name))
    }
}

/// Builder for [`Definition`].
pub struct DefinitionBuilder<O> {
    description: Option<Str>,
    implementations: Vec<ImplementationBuilder<O>>,
}

impl<O> DefinitionBuilder<O> {
    /// Set the free-form description.
    pub fn description(mut self, description: impl Into<Str>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add an implementation. Names must be unique.
    pub fn implementation(mut self, implementation: ImplementationBuilder<O>) -> Self {
        self.implementations.push(implementation);
        self
    }

    /// Validate every declared implementation, collecting all problems instead of stopping at
    /// the first one.
    pub fn build(self) -> Result<Definition<O>> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();
        let mut implementations = BTreeMap::new();
        let mut annotations: BTreeMap<Str, Vec<Str>> = BTreeMap::new();

        if self.implementations.is_empty() {
            problems.push("definition must contain at least one implementation".to_owned());
        }

        for builder in self.implementations {
            if !seen.insert(builder.name.clone()) {
                problems.push(format!(
                    "implementation {:?} is declared more than once",
                    builder.name
                ));
                continue;
            }
            match builder.build() {
                Ok(implementation) => {
                    for tag in &implementation.tags {
                        annotations
                            .entry(tag.clone())
                            .or_default()
                            .push(implementation.name.clone());
                    }
                    implementations.insert(implementation.name.clone(), implementation);
                }
                Err(problem) => problems.push(problem),
            }
        }

        if !problems.is_empty() {
            return Err(Error::InvalidDefinition { problems });
        }

        Ok(Definition {
            description: self.description,
            implementations,
            annotations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Definition, Implementation};
    use crate::{value::InputType, Error, Str, Value};

    fn constant(name: &str) -> super::ImplementationBuilder<String> {
        let value = name.to_owned();
        Implementation::builder(name)
            .input(InputType::String)
            .func(move |_: &[Value]| value.clone())
    }

    #[test]
    fn indexes_tags_in_declaration_order() {
        let definition = Definition::builder()
            .implementation(constant("b").tag("beta"))
            .implementation(constant("a").tag("beta").default())
            .build()
            .unwrap();

        let beta: Vec<Str> = definition.tagged("beta").map(|i| i.name().clone()).collect();
        let expected: Vec<Str> = vec!["b".into(), "a".into()];
        assert_eq!(beta, expected);
        assert_eq!(definition.tagged("default").count(), 1);
        assert_eq!(definition.tagged("missing").count(), 0);
    }

    #[test]
    fn empty_definition_is_rejected() {
        let result = Definition::<String>::builder().build();
        assert!(matches!(result, Err(Error::InvalidDefinition { .. })));
    }

    #[test]
    fn reports_every_problem_at_once() {
        let result = Definition::builder()
            .implementation(Implementation::<String>::builder("no_func").input(InputType::String))
            .implementation(constant("dup"))
            .implementation(constant("dup"))
            .implementation(constant(""))
            .build();

        let Err(Error::InvalidDefinition { problems }) = result else {
            panic!("expected InvalidDefinition, got {:?}", result);
        };
        assert_eq!(problems.len(), 3, "{:?}", problems);
        assert!(problems[0].contains("no_func"));
        assert!(problems[1].contains("dup"));
    }

    #[test]
    fn checks_arguments_against_declared_inputs() {
        let implementation = Implementation::builder("len")
            .input(InputType::Number)
            .func(|args: &[Value]| args.len())
            .build()
            .unwrap();

        assert!(implementation.check_arguments(&[Value::Integer(3)]).is_ok());
        assert!(matches!(
            implementation.check_arguments(&["three".into()]),
            Err(Error::InvalidArguments { .. })
        ));
        assert!(implementation.check_arguments(&[]).is_err());
        assert_eq!(implementation.call(&[Value::Integer(3)]), 1);
    }
}
