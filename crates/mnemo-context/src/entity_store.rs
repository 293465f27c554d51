//! Deduplicated entity storage with a directed relationship graph.
//!
//! Entities are unique by `(normalized_text, label)`. Re-mentioning an
//! entity merges into the existing record instead of creating a new one.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use mnemo_core::ids::EntityId;
use tracing::trace;

use crate::constants::{
    RECENCY_HALF_LIFE_SECS, RELEVANCE_MENTION_WEIGHT, RELEVANCE_RECENCY_WEIGHT,
    RELEVANCE_RELATIONSHIP_WEIGHT,
};
use crate::errors::{ContextError, Result};
use crate::types::{Entity, EntityLabel, Relationship, normalize_entity_text};

/// Entity map plus the `(normalized_text, label)` index.
#[derive(Clone, Debug, Default)]
pub struct EntityStore {
    entities: BTreeMap<EntityId, Entity>,
    index: HashMap<(String, EntityLabel), EntityId>,
}

impl EntityStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted entities. Callers validate uniqueness first.
    pub fn from_entities(entities: BTreeMap<EntityId, Entity>) -> Self {
        let index = entities
            .values()
            .map(|e| ((e.normalized_text.clone(), e.label), e.id.clone()))
            .collect();
        Self { entities, index }
    }

    /// Entities by ID.
    pub fn entities(&self) -> &BTreeMap<EntityId, Entity> {
        &self.entities
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Look up by ID.
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Look up by surface text and label.
    pub fn find_by_text(&self, text: &str, label: EntityLabel) -> Option<&Entity> {
        let key = (normalize_entity_text(text, label), label);
        self.index.get(&key).and_then(|id| self.entities.get(id))
    }

    /// Add a new entity or merge a re-mention into the existing one.
    pub fn add_or_merge(
        &mut self,
        text: &str,
        label: EntityLabel,
        confidence: f64,
    ) -> Result<EntityId> {
        self.add_or_merge_at(text, label, confidence, Utc::now())
    }

    /// [`add_or_merge`](Self::add_or_merge) with an explicit clock.
    pub fn add_or_merge_at(
        &mut self,
        text: &str,
        label: EntityLabel,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<EntityId> {
        if text.trim().is_empty() {
            return Err(ContextError::InvalidEntity("entity text is empty".into()));
        }
        if !confidence.is_finite() {
            return Err(ContextError::InvalidEntity(format!(
                "confidence must be finite, got {confidence}"
            )));
        }
        let confidence = confidence.clamp(0.0, 1.0);
        let normalized = normalize_entity_text(text, label);

        if let Some(id) = self.index.get(&(normalized.clone(), label)) {
            if let Some(entity) = self.entities.get_mut(id) {
                entity.mention_count = entity.mention_count.saturating_add(1);
                entity.last_seen = now;
                entity.confidence = entity.confidence.max(confidence);
                trace!(entity_id = %id, mentions = entity.mention_count, "entity merged");
                return Ok(id.clone());
            }
        }

        let id = EntityId::new();
        let entity = Entity {
            id: id.clone(),
            normalized_text: normalized.clone(),
            display_text: text.split_whitespace().collect::<Vec<_>>().join(" "),
            label,
            confidence,
            mention_count: 1,
            first_seen: now,
            last_seen: now,
            relationships: Vec::new(),
        };
        let _ = self.index.insert((normalized, label), id.clone());
        let _ = self.entities.insert(id.clone(), entity);
        trace!(entity_id = %id, %label, "entity added");
        Ok(id)
    }

    /// All entities with `label`, most recently seen first.
    pub fn get_by_type(&self, label: EntityLabel) -> Vec<&Entity> {
        let mut found: Vec<&Entity> = self.entities.values().filter(|e| e.label == label).collect();
        found.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        found
    }

    /// Up to `limit` entities by mention count, highest first. Ties go to the
    /// most recently seen.
    pub fn most_frequent(&self, label: Option<EntityLabel>, limit: usize) -> Vec<&Entity> {
        let mut found: Vec<&Entity> = self
            .entities
            .values()
            .filter(|e| label.is_none_or(|l| e.label == l))
            .collect();
        found.sort_by(|a, b| {
            b.mention_count
                .cmp(&a.mention_count)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        found.truncate(limit);
        found
    }

    /// Add a directed edge. Returns `false` if the same edge already exists.
    pub fn relate(&mut self, from: &EntityId, relation: &str, to: &EntityId) -> Result<bool> {
        if !self.entities.contains_key(to) {
            return Err(ContextError::EntityNotFound(to.clone()));
        }
        let source = self
            .entities
            .get_mut(from)
            .ok_or_else(|| ContextError::EntityNotFound(from.clone()))?;
        if source
            .relationships
            .iter()
            .any(|r| r.relation == relation && &r.target == to)
        {
            return Ok(false);
        }
        source.relationships.push(Relationship {
            relation: relation.to_owned(),
            target: to.clone(),
        });
        Ok(true)
    }

    /// Remove an entity and every edge pointing at it.
    pub fn remove(&mut self, id: &EntityId) -> Option<Entity> {
        let removed = self.entities.remove(id)?;
        let _ = self.index.remove(&(removed.normalized_text.clone(), removed.label));
        for entity in self.entities.values_mut() {
            entity.relationships.retain(|r| &r.target != id);
        }
        Some(removed)
    }

    /// Entities reachable from `id` within `max_depth` hops, nearest first.
    ///
    /// The start entity is not included. Cycles are visited once.
    pub fn find_related(&self, id: &EntityId, max_depth: usize) -> Vec<&Entity> {
        let mut found = Vec::new();
        if !self.entities.contains_key(id) || max_depth == 0 {
            return found;
        }

        let mut visited: HashSet<&EntityId> = HashSet::new();
        let _ = visited.insert(id);
        let mut queue: VecDeque<(&EntityId, usize)> = VecDeque::new();
        queue.push_back((id, 0));

        while let Some((current, depth)) = queue.pop_front() {
            let Some(entity) = self.entities.get(current) else {
                continue;
            };
            if depth >= max_depth {
                continue;
            }
            for rel in &entity.relationships {
                if visited.insert(&rel.target) {
                    if let Some(target) = self.entities.get(&rel.target) {
                        found.push(target);
                        queue.push_back((&rel.target, depth + 1));
                    }
                }
            }
        }
        found
    }

    // ─────────────────────────────────────────────────────────────────────
    // Relevance
    // ─────────────────────────────────────────────────────────────────────

    fn maxima(&self) -> (u32, usize) {
        self.entities.values().fold((0, 0), |(m, r), e| {
            (m.max(e.mention_count), r.max(e.relationships.len()))
        })
    }

    /// Relevance of one entity in `[0, 1]`, relative to the rest of the store.
    pub fn relevance_score(&self, id: &EntityId, now: DateTime<Utc>) -> Option<f64> {
        let (max_mentions, max_rels) = self.maxima();
        self.entities
            .get(id)
            .map(|e| score(e, max_mentions, max_rels, now))
    }

    /// Relevance of every entity.
    pub fn relevance_scores(&self, now: DateTime<Utc>) -> HashMap<EntityId, f64> {
        let (max_mentions, max_rels) = self.maxima();
        self.entities
            .iter()
            .map(|(id, e)| (id.clone(), score(e, max_mentions, max_rels, now)))
            .collect()
    }

    /// Which of `candidates` score below `threshold`. Does not mutate.
    pub fn prunable(
        &self,
        candidates: &[EntityId],
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Vec<EntityId> {
        let scores = self.relevance_scores(now);
        candidates
            .iter()
            .filter(|id| scores.get(*id).is_some_and(|s| *s < threshold))
            .cloned()
            .collect()
    }
}

#[allow(clippy::cast_precision_loss)]
fn score(entity: &Entity, max_mentions: u32, max_rels: usize, now: DateTime<Utc>) -> f64 {
    let mentions = if max_mentions == 0 {
        0.0
    } else {
        f64::from(entity.mention_count) / f64::from(max_mentions)
    };
    let rels = if max_rels == 0 {
        0.0
    } else {
        entity.relationships.len() as f64 / max_rels as f64
    };
    let age_secs = (now - entity.last_seen).num_milliseconds().max(0) as f64 / 1000.0;
    let recency = 0.5_f64.powf(age_secs / RECENCY_HALF_LIFE_SECS);

    RELEVANCE_MENTION_WEIGHT * mentions
        + RELEVANCE_RECENCY_WEIGHT * recency
        + RELEVANCE_RELATIONSHIP_WEIGHT * rels
}
