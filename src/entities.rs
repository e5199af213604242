//! Live entity state mirror
//!
//! Maintains a local map of every entity the hub knows about, kept current
//! through the collection layer. Hubs from 2022.4 on stream compressed
//! diffs over `subscribe_entities`; older hubs get the full dump via
//! `get_states` plus per-entity `state_changed` events.
//!
//! Update application is copy-on-write per entity: entries untouched by a
//! diff keep their `Arc` identity, so consumers can detect change cheaply
//! with pointer equality.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::collection::{
    self, Collection, CollectionOptions, CollectionSubscription, FetchFn, SubscribeFn,
};
use crate::error::Result;
use crate::protocol::{self, at_least_version};
use crate::session::Session;
use crate::store::Store;

const COLLECTION_KEY: &str = "entities";

/// First hub version that streams compressed entity diffs.
const STREAMING_SINCE: (u32, u32, u32) = (2022, 4, 0);

/// Event context attached to every entity state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// One entity's current state as reported by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub context: EntityContext,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// All known entities keyed by entity id.
pub type EntityMap = HashMap<String, Arc<EntityState>>;

/// Fetch a full state dump. This is the one-shot query; for a live view
/// use [`subscribe_entities`].
pub async fn get_states(session: &Session) -> Result<Vec<EntityState>> {
    let result = session.send_command(protocol::get_states_message()).await?;
    Ok(serde_json::from_value(result)?)
}

/// The shared entity collection for this session, created on first use.
///
/// The hub version decides the transport: streaming diffs where supported,
/// otherwise full fetch plus `state_changed` events.
pub fn entity_collection(session: &Session) -> Collection<EntityMap> {
    let (major, minor, patch) = STREAMING_SINCE;
    if at_least_version(&session.ha_version(), major, minor, patch) {
        collection::get_collection(
            session,
            COLLECTION_KEY,
            None,
            Some(streamed_updates()),
            CollectionOptions::default(),
        )
    } else {
        collection::get_collection(
            session,
            COLLECTION_KEY,
            Some(legacy_fetch()),
            Some(legacy_updates()),
            CollectionOptions::default(),
        )
    }
}

/// Watch the entity map. `callback` gets the full map after every change;
/// the first delivery happens once initial state arrives.
pub async fn subscribe_entities(
    session: &Session,
    callback: impl Fn(&EntityMap) + Send + Sync + 'static,
) -> CollectionSubscription {
    entity_collection(session).subscribe(callback).await
}

fn streamed_updates() -> SubscribeFn<EntityMap> {
    Arc::new(|session: Session, store: Store<EntityMap>| {
        Box::pin(async move {
            session
                .subscribe(protocol::subscribe_entities_message(), move |event| {
                    match serde_json::from_value::<CompressedStateUpdate>(event) {
                        Ok(update) => store.update(|current| apply_update(current, update)),
                        Err(e) => warn!(error = %e, "Malformed entity update"),
                    }
                })
                .await
        })
    })
}

fn legacy_fetch() -> FetchFn<EntityMap> {
    Arc::new(|session: Session| {
        Box::pin(async move {
            let states = get_states(&session).await?;
            Ok(states
                .into_iter()
                .map(|state| (state.entity_id.clone(), Arc::new(state)))
                .collect())
        })
    })
}

fn legacy_updates() -> SubscribeFn<EntityMap> {
    Arc::new(|session: Session, store: Store<EntityMap>| {
        Box::pin(async move {
            session
                .subscribe_events(Some("state_changed"), move |event| {
                    let change = match serde_json::from_value::<StateChangedEvent>(event) {
                        Ok(parsed) => parsed.data,
                        Err(e) => {
                            warn!(error = %e, "Malformed state_changed event");
                            return;
                        }
                    };
                    // Events racing ahead of the initial fetch are dropped;
                    // the fetch result covers them.
                    if store.get().is_none() {
                        return;
                    }
                    match change.new_state {
                        Some(new_state) => store.update(|current| {
                            let mut entities = current.unwrap_or_default();
                            entities.insert(new_state.entity_id.clone(), Arc::new(new_state));
                            entities
                        }),
                        None => store.update(|current| {
                            let mut entities = current.unwrap_or_default();
                            entities.remove(&change.entity_id);
                            entities
                        }),
                    }
                })
                .await
        })
    })
}

#[derive(Debug, Deserialize)]
struct StateChangedEvent {
    data: StateChange,
}

#[derive(Debug, Deserialize)]
struct StateChange {
    entity_id: String,
    #[serde(default)]
    new_state: Option<EntityState>,
}

/// Wire shape of one `subscribe_entities` message: full additions, removed
/// ids, and per-entity field diffs.
#[derive(Debug, Deserialize)]
struct CompressedStateUpdate {
    #[serde(default, rename = "a")]
    add: HashMap<String, CompressedEntity>,
    #[serde(default, rename = "r")]
    remove: Vec<String>,
    #[serde(default, rename = "c")]
    change: HashMap<String, CompressedEntityDiff>,
}

#[derive(Debug, Deserialize)]
struct CompressedEntity {
    #[serde(rename = "s")]
    state: String,
    #[serde(default, rename = "a")]
    attributes: Map<String, Value>,
    #[serde(rename = "c")]
    context: CompressedContext,
    #[serde(rename = "lc")]
    last_changed: f64,
    #[serde(default, rename = "lu")]
    last_updated: Option<f64>,
}

/// Context arrives as a bare id when parent and user are unset.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompressedContext {
    Id(String),
    Full(EntityContext),
}

impl CompressedContext {
    fn into_context(self) -> EntityContext {
        match self {
            CompressedContext::Id(id) => EntityContext {
                id,
                parent_id: None,
                user_id: None,
            },
            CompressedContext::Full(context) => context,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CompressedEntityDiff {
    #[serde(default, rename = "+")]
    add: Option<CompressedEntityAdd>,
    #[serde(default, rename = "-")]
    remove: Option<CompressedEntityRemove>,
}

#[derive(Debug, Default, Deserialize)]
struct CompressedEntityAdd {
    #[serde(default, rename = "s")]
    state: Option<String>,
    #[serde(default, rename = "a")]
    attributes: Map<String, Value>,
    #[serde(default, rename = "c")]
    context: Option<ContextDelta>,
    #[serde(default, rename = "lc")]
    last_changed: Option<f64>,
    #[serde(default, rename = "lu")]
    last_updated: Option<f64>,
}

/// Context in a change diff: either a bare id, or a partial object whose
/// present keys overwrite the existing context.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContextDelta {
    Id(String),
    Fields(Map<String, Value>),
}

fn apply_context_delta(context: &mut EntityContext, delta: ContextDelta) {
    match delta {
        ContextDelta::Id(id) => context.id = id,
        ContextDelta::Fields(fields) => {
            for (key, value) in fields {
                match key.as_str() {
                    "id" => {
                        if let Value::String(id) = value {
                            context.id = id;
                        }
                    }
                    "parent_id" => context.parent_id = as_string(value),
                    "user_id" => context.user_id = as_string(value),
                    _ => {}
                }
            }
        }
    }
}

fn as_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
struct CompressedEntityRemove {
    #[serde(default, rename = "a")]
    attributes: Vec<String>,
}

fn from_epoch(seconds: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis((seconds * 1000.0) as i64).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Apply one compressed update. Additions first, then removals, then
/// changes; changed entities are rebuilt, everything else keeps its `Arc`.
fn apply_update(current: Option<EntityMap>, update: CompressedStateUpdate) -> EntityMap {
    let mut entities = current.unwrap_or_default();

    for (entity_id, added) in update.add {
        let last_changed = from_epoch(added.last_changed);
        let last_updated = added.last_updated.map(from_epoch).unwrap_or(last_changed);
        let entity = EntityState {
            entity_id: entity_id.clone(),
            state: added.state,
            attributes: added.attributes,
            context: added.context.into_context(),
            last_changed,
            last_updated,
        };
        entities.insert(entity_id, Arc::new(entity));
    }

    for entity_id in update.remove {
        entities.remove(&entity_id);
    }

    for (entity_id, change) in update.change {
        let Some(existing) = entities.get(&entity_id) else {
            warn!(entity = %entity_id, "State update for unknown entity");
            continue;
        };
        let mut entity = EntityState::clone(existing);

        if let Some(add) = change.add {
            if let Some(state) = add.state {
                entity.state = state;
            }
            if let Some(context) = add.context {
                apply_context_delta(&mut entity.context, context);
            }
            if let Some(last_changed) = add.last_changed {
                let stamp = from_epoch(last_changed);
                entity.last_changed = stamp;
                entity.last_updated = stamp;
            } else if let Some(last_updated) = add.last_updated {
                entity.last_updated = from_epoch(last_updated);
            }
            for (key, value) in add.attributes {
                entity.attributes.insert(key, value);
            }
        }
        if let Some(remove) = change.remove {
            for key in remove.attributes {
                entity.attributes.remove(&key);
            }
        }

        entities.insert(entity_id, Arc::new(entity));
    }

    entities
}
