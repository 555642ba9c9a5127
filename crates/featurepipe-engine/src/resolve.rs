//! Dependency resolution: feature graph construction, reference checks and
//! topological ordering.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{Entity, FeatureDefinition, PipelineSpec};
use crate::error::ConfigError;

/// One feature in evaluation order, with the features it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub feature: FeatureDefinition,
    /// Feature names this step depends on (references plus `depends_on`).
    pub depends_on: Vec<String>,
}

/// Topologically sorted feature sequence for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub entity: Entity,
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    #[must_use]
    pub fn key_column(&self) -> &str {
        &self.entity.key_column
    }

    #[must_use]
    pub fn feature_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.feature.name.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn position(&self, feature: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.feature.name == feature)
    }

    /// Transitive feature dependencies of `feature`, in plan order.
    #[must_use]
    pub fn transitive_dependencies(&self, feature: &str) -> Vec<&str> {
        let mut needed: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = vec![feature];
        while let Some(name) = stack.pop() {
            if let Some(step) = self.steps.iter().find(|s| s.feature.name == name) {
                for dep in &step.depends_on {
                    if needed.insert(dep.as_str()) {
                        stack.push(dep.as_str());
                    }
                }
            }
        }
        self.steps
            .iter()
            .map(|s| s.feature.name.as_str())
            .filter(|name| needed.contains(name))
            .collect()
    }

    /// The sub-plan computing `feature` and everything it depends on, in the
    /// same relative order. `None` if `feature` is not in the plan.
    #[must_use]
    pub fn restricted_to(&self, feature: &str) -> Option<Self> {
        self.position(feature)?;
        let mut keep: BTreeSet<&str> = self.transitive_dependencies(feature).into_iter().collect();
        keep.insert(feature);
        Some(Self {
            entity: self.entity.clone(),
            steps: self
                .steps
                .iter()
                .filter(|s| keep.contains(s.feature.name.as_str()))
                .cloned()
                .collect(),
        })
    }
}

/// Resolve every feature declared in `spec`.
///
/// # Errors
///
/// Returns a [`ConfigError`] for unknown entities, key-column mismatches,
/// duplicate or ambiguous names, unresolved references and cycles.
pub fn resolve(spec: &PipelineSpec) -> Result<ExecutionPlan, ConfigError> {
    resolve_features(spec, &spec.features)
}

/// Resolve an explicit feature set against the sources and entities of
/// `spec`. Features with no ordering constraint between them keep their
/// declaration order.
///
/// # Errors
///
/// See [`resolve`].
pub fn resolve_features(
    spec: &PipelineSpec,
    features: &[FeatureDefinition],
) -> Result<ExecutionPlan, ConfigError> {
    let entity = spec
        .target_entity()
        .cloned()
        .ok_or_else(|| ConfigError::UnknownEntity(spec.entity.clone()))?;

    check_source_keys(spec)?;

    let source_columns = spec.source_columns();
    let mut index: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, feature) in features.iter().enumerate() {
        if index.insert(feature.name.as_str(), i).is_some() {
            return Err(ConfigError::DuplicateFeature(feature.name.clone()));
        }
        if let Some(owner) = &feature.entity {
            if *owner != entity.name {
                return Err(ConfigError::EntityMismatch {
                    feature: feature.name.clone(),
                    expected: entity.name.clone(),
                    found: owner.clone(),
                });
            }
        }
        if source_columns.contains(feature.name.as_str()) {
            return Err(ConfigError::AmbiguousName(feature.name.clone()));
        }
    }

    // deps[i]: indices of features that feature i reads.
    let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); features.len()];
    for (i, feature) in features.iter().enumerate() {
        for reference in feature.transformation.references() {
            if let Some(&j) = index.get(reference) {
                deps[i].insert(j);
            } else if !source_columns.contains(reference) {
                return Err(ConfigError::UnresolvedReference {
                    feature: feature.name.clone(),
                    identifier: reference.to_string(),
                });
            }
        }
        for dependency in &feature.depends_on {
            let j = index.get(dependency.as_str()).copied().ok_or_else(|| {
                ConfigError::UnresolvedReference {
                    feature: feature.name.clone(),
                    identifier: dependency.clone(),
                }
            })?;
            deps[i].insert(j);
        }
    }

    let order = topological_order(&deps).map_err(|members| ConfigError::Cycle {
        members: members
            .into_iter()
            .map(|i| features[i].name.clone())
            .collect(),
    })?;

    let steps = order
        .into_iter()
        .map(|i| PlanStep {
            feature: features[i].clone(),
            depends_on: deps[i].iter().map(|&j| features[j].name.clone()).collect(),
        })
        .collect();

    tracing::debug!(
        pipeline = spec.pipeline,
        features = features.len(),
        "Resolved execution plan"
    );

    Ok(ExecutionPlan { entity, steps })
}

/// Every source feeding an entity must key it by that entity's key column.
fn check_source_keys(spec: &PipelineSpec) -> Result<(), ConfigError> {
    for source in &spec.source_tables {
        let owner = source.entity.as_deref().unwrap_or(&spec.entity);
        let entity = spec
            .find_entity(owner)
            .ok_or_else(|| ConfigError::UnknownEntity(owner.to_string()))?;
        if source.key_column != entity.key_column {
            return Err(ConfigError::KeyColumnMismatch {
                source_name: source.source.clone(),
                entity: entity.name.clone(),
                expected: entity.key_column.clone(),
                found: source.key_column.clone(),
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm. Ready nodes are taken lowest index first so the order
/// is deterministic. On a cycle, returns its members with the first member
/// repeated at the end.
fn topological_order(deps: &[BTreeSet<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = deps.len();
    let mut remaining: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, ds) in deps.iter().enumerate() {
        for &j in ds {
            dependents[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    // Every unprocessed node still has an unprocessed dependency, so walking
    // dependencies from any of them must revisit a node.
    let done: BTreeSet<usize> = order.into_iter().collect();
    let start = (0..n).find(|i| !done.contains(i)).unwrap_or_default();
    let mut path: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|&p| p == current) {
            let mut cycle = path.split_off(pos);
            cycle.push(current);
            return Err(cycle);
        }
        path.push(current);
        match deps[current].iter().find(|j| !done.contains(j)) {
            Some(&next) => current = next,
            None => return Err(path),
        }
    }
}
