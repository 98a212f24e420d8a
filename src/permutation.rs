//! Lazy cross-product expansion of a template over variable bindings.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::template::{settings_key, PromptTemplate, TemplateValue, SETTINGS_PREFIX};

/// One or many values bound to a variable. A single value behaves as a
/// one-element list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValues {
    Many(Vec<TemplateValue>),
    One(TemplateValue),
}

impl VarValues {
    pub fn as_slice(&self) -> &[TemplateValue] {
        match self {
            VarValues::Many(values) => values,
            VarValues::One(value) => std::slice::from_ref(value),
        }
    }
}

impl<T: Into<TemplateValue>> From<Vec<T>> for VarValues {
    fn from(values: Vec<T>) -> Self {
        VarValues::Many(values.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for VarValues {
    fn from(value: &str) -> Self {
        VarValues::One(value.into())
    }
}

impl From<TemplateValue> for VarValues {
    fn from(value: TemplateValue) -> Self {
        VarValues::One(value)
    }
}

/// Variable name (settings variables keep their `=` prefix) to values.
pub type VarBindings = BTreeMap<String, VarValues>;

/// Produces every fill of a template over a set of bindings.
#[derive(Debug, Clone)]
pub struct PromptPermutationGenerator {
    template: PromptTemplate,
}

impl PromptPermutationGenerator {
    pub fn new(template: &str) -> Self {
        Self::from_template(PromptTemplate::new(template))
    }

    pub fn from_template(template: PromptTemplate) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    /// Iterate the cross product of all bound variables.
    ///
    /// Variables are ordered by first appearance in the template (content,
    /// then settings placeholders), followed by bound settings variables the
    /// text does not mention, by name. The first variable is the outermost
    /// loop. Each call starts a fresh iteration.
    pub fn generate<'a>(&'a self, bindings: &'a VarBindings) -> Permutations<'a> {
        let mut dims: Vec<(&'a str, &'a [TemplateValue])> = Vec::new();

        let push = |key: &str, dims: &mut Vec<(&'a str, &'a [TemplateValue])>| {
            if dims.iter().any(|(k, _)| *k == key) {
                return;
            }
            if let Some((k, v)) = bindings.get_key_value(key) {
                dims.push((k.as_str(), v.as_slice()));
            }
        };

        for name in self.template.placeholders() {
            push(name, &mut dims);
        }
        for name in self.template.settings_placeholders() {
            push(&settings_key(name), &mut dims);
        }
        for key in bindings.keys() {
            if key.starts_with(SETTINGS_PREFIX) {
                push(key, &mut dims);
            }
        }

        let linked = linked_dimensions(&dims);
        let done = dims.iter().any(|(_, values)| values.is_empty());

        Permutations {
            base: &self.template,
            indices: vec![0; dims.len()],
            dims,
            linked,
            done,
        }
    }
}

/// Lazy iterator over filled templates, driven by one index counter per
/// variable.
#[derive(Debug)]
pub struct Permutations<'a> {
    base: &'a PromptTemplate,
    dims: Vec<(&'a str, &'a [TemplateValue])>,
    /// Pairs of dimensions whose values share associate ids.
    linked: Vec<(usize, usize)>,
    indices: Vec<usize>,
    done: bool,
}

impl Permutations<'_> {
    fn current_is_consistent(&self) -> bool {
        self.linked.iter().all(|&(a, b)| {
            let left = self.dims[a].1[self.indices[a]].associate_id();
            let right = self.dims[b].1[self.indices[b]].associate_id();
            match (left, right) {
                (Some(l), Some(r)) => l == r,
                _ => true,
            }
        })
    }

    fn build_current(&self) -> PromptTemplate {
        let bindings: BTreeMap<String, TemplateValue> = self
            .dims
            .iter()
            .zip(&self.indices)
            .map(|((key, values), &idx)| (key.to_string(), values[idx].clone()))
            .collect();
        self.base.fill(&bindings)
    }

    fn advance(&mut self) {
        for k in (0..self.dims.len()).rev() {
            self.indices[k] += 1;
            if self.indices[k] < self.dims[k].1.len() {
                return;
            }
            self.indices[k] = 0;
        }
        self.done = true;
    }
}

impl Iterator for Permutations<'_> {
    type Item = PromptTemplate;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let item = self
                .current_is_consistent()
                .then(|| self.build_current());
            self.advance();
            if item.is_some() {
                return item;
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let total = self
            .dims
            .iter()
            .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()));
        (0, total)
    }
}

fn linked_dimensions(dims: &[(&str, &[TemplateValue])]) -> Vec<(usize, usize)> {
    let ids: Vec<BTreeSet<&str>> = dims
        .iter()
        .map(|(_, values)| values.iter().filter_map(TemplateValue::associate_id).collect())
        .collect();

    let mut linked = Vec::new();
    for a in 0..ids.len() {
        for b in (a + 1)..ids.len() {
            if !ids[a].is_disjoint(&ids[b]) {
                linked.push((a, b));
            }
        }
    }
    linked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateVarInfo;
    use std::collections::HashSet;

    fn bindings(pairs: Vec<(&str, VarValues)>) -> VarBindings {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn rendered(gen: &PromptPermutationGenerator, vars: &VarBindings) -> Vec<String> {
        gen.generate(vars).map(|t| t.render().unwrap()).collect()
    }

    #[test]
    fn who_is_example() {
        let gen = PromptPermutationGenerator::new("Who is {person}?");
        let vars = bindings(vec![("person", vec!["TJ", "MJ"].into())]);
        assert_eq!(rendered(&gen, &vars), vec!["Who is TJ?", "Who is MJ?"]);
    }

    #[test]
    fn yields_full_product_with_distinct_histories() {
        let gen = PromptPermutationGenerator::new("{a}-{b}-{c}");
        let vars = bindings(vec![
            ("a", vec!["1", "2"].into()),
            ("b", vec!["x", "y", "z"].into()),
            ("c", vec!["p", "q"].into()),
        ]);
        let all: Vec<PromptTemplate> = gen.generate(&vars).collect();
        assert_eq!(all.len(), 12);
        assert!(all.iter().all(PromptTemplate::is_concrete));
        let histories: HashSet<Vec<(String, String)>> = all
            .iter()
            .map(|t| t.fill_history().clone().into_iter().collect())
            .collect();
        assert_eq!(histories.len(), 12);
    }

    #[test]
    fn first_variable_is_outermost_and_order_is_stable() {
        let gen = PromptPermutationGenerator::new("{b}{a}");
        let vars = bindings(vec![("a", vec!["1", "2"].into()), ("b", vec!["x", "y"].into())]);
        let first = rendered(&gen, &vars);
        assert_eq!(first, vec!["x1", "x2", "y1", "y2"]);
        assert_eq!(rendered(&gen, &vars), first);
    }

    #[test]
    fn scalar_is_a_singleton_and_empty_list_yields_nothing() {
        let gen = PromptPermutationGenerator::new("{a} {b}");
        let vars = bindings(vec![("a", "only".into()), ("b", vec!["1", "2"].into())]);
        assert_eq!(rendered(&gen, &vars), vec!["only 1", "only 2"]);

        let empty: Vec<&str> = Vec::new();
        let vars = bindings(vec![("a", "only".into()), ("b", empty.into())]);
        assert_eq!(gen.generate(&vars).count(), 0);
    }

    #[test]
    fn unbound_placeholders_stay_open() {
        let gen = PromptPermutationGenerator::new("{a} {missing}");
        let vars = bindings(vec![("a", vec!["1", "2"].into())]);
        let all: Vec<PromptTemplate> = gen.generate(&vars).collect();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|t| !t.is_concrete()));
    }

    #[test]
    fn settings_vars_participate_in_the_product() {
        let gen = PromptPermutationGenerator::new("Hi {name}");
        let vars = bindings(vec![
            ("name", vec!["A", "B"].into()),
            ("=temperature", vec!["0", "1"].into()),
        ]);
        let all: Vec<PromptTemplate> = gen.generate(&vars).collect();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].render().unwrap(), "Hi A");
        assert_eq!(all[0].settings_vars()["temperature"], "0");
        assert_eq!(all[1].settings_vars()["temperature"], "1");
    }

    #[test]
    fn associated_values_stay_paired() {
        let gen = PromptPermutationGenerator::new("{name} is {age}");
        let row = |id: &str, text: &str| {
            TemplateValue::from(TemplateVarInfo::new(text).with_associate_id(id))
        };
        let vars = bindings(vec![
            ("name", VarValues::Many(vec![row("r1", "Ann"), row("r2", "Bo")])),
            ("age", VarValues::Many(vec![row("r1", "30"), row("r2", "41")])),
        ]);
        assert_eq!(rendered(&gen, &vars), vec!["Ann is 30", "Bo is 41"]);
    }

    #[test]
    fn metavars_of_chosen_values_are_merged() {
        let gen = PromptPermutationGenerator::new("{q}");
        let value = TemplateValue::from(TemplateVarInfo::new("why").with_metavar("split", "test"));
        let vars = bindings(vec![("q", value.into())]);
        let t = gen.generate(&vars).next().unwrap();
        assert_eq!(t.metavars()["split"], "test");
    }
}
