//! # Livedata Bridge
//!
//! Turns entity change streams into subscription traffic:
//!
//! - `filter_event_stream` narrows a stream to entities matching a predicate,
//!   synthesizing creations and deletions when an entity moves in or out
//! - `render_event_stream` maps entity events to document events for one
//!   collection, sending only the fields that actually changed
//! - `emit_to_sub` drives any number of rendered streams into one
//!   subscription handle

use std::collections::{HashMap, HashSet};
use std::future;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use tracing::debug;

use crate::ddp::{DocumentFields, EJson};
use crate::engine::{Entity, StreamEvent};

use super::errors::{HandlerError, RealtimeResult};
use super::subscription::SubscriptionHandle;

/// Document-level event for one subscription
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Added {
        collection: String,
        id: String,
        fields: DocumentFields,
    },
    Changed {
        collection: String,
        id: String,
        fields: DocumentFields,
    },
    Removed {
        collection: String,
        id: String,
    },
    /// Initial snapshot delivered
    Ready,
    /// Source ended, with an error message if it failed
    NoSub { error: Option<String> },
}

/// A rendered stream ready for `emit_to_sub`
pub type SubscriptionSource = BoxStream<'static, SubscriptionEvent>;

/// Keep only entities accepted by `predicate`
///
/// A mutation that flips the predicate becomes a synthetic `Deletion` or
/// `Creation`, so downstream sees each entity appear at most once before it
/// disappears again. A repeated creation of a visible entity is forwarded
/// as a `Mutation`.
pub fn filter_event_stream<S, P>(stream: S, mut predicate: P) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = StreamEvent>,
    P: FnMut(&Entity) -> bool,
{
    let mut visible: HashSet<String> = HashSet::new();
    stream.filter_map(move |event| {
        let out = match event {
            StreamEvent::Creation(entity) => {
                let was_visible = visible.contains(entity.name());
                match (was_visible, predicate(&entity)) {
                    (false, true) => {
                        visible.insert(entity.name().to_string());
                        Some(StreamEvent::Creation(entity))
                    }
                    (true, true) => Some(StreamEvent::Mutation(entity)),
                    (true, false) => {
                        visible.remove(entity.name());
                        Some(StreamEvent::Deletion(entity))
                    }
                    (false, false) => None,
                }
            }
            StreamEvent::Mutation(entity) => {
                let was_visible = visible.contains(entity.name());
                let passes = predicate(&entity);
                match (was_visible, passes) {
                    (true, true) => Some(StreamEvent::Mutation(entity)),
                    (true, false) => {
                        visible.remove(entity.name());
                        Some(StreamEvent::Deletion(entity))
                    }
                    (false, true) => {
                        visible.insert(entity.name().to_string());
                        Some(StreamEvent::Creation(entity))
                    }
                    (false, false) => None,
                }
            }
            StreamEvent::Deletion(entity) => {
                if visible.remove(entity.name()) {
                    Some(StreamEvent::Deletion(entity))
                } else {
                    None
                }
            }
            other => Some(other),
        };
        future::ready(out)
    })
}

/// Map entity events to document events for `collection`
///
/// Mutations are diffed against what was last rendered for the same id:
/// changed keys carry their new value, vanished keys go out as `Undefined`,
/// and a mutation that changes nothing is dropped. Bookmarks are dropped.
pub fn render_event_stream<T, S, I, F>(
    stream: S,
    collection: impl Into<String>,
    id_fn: I,
    fields_fn: F,
) -> impl Stream<Item = SubscriptionEvent>
where
    S: Stream<Item = StreamEvent<T>>,
    I: Fn(&T) -> String,
    F: Fn(&T) -> DocumentFields,
{
    let collection = collection.into();
    let mut rendered: HashMap<String, DocumentFields> = HashMap::new();

    stream.filter_map(move |event| {
        let out = match event {
            StreamEvent::Creation(snapshot) => {
                let id = id_fn(&snapshot);
                let fields = fields_fn(&snapshot);
                rendered.insert(id.clone(), fields.clone());
                Some(SubscriptionEvent::Added {
                    collection: collection.clone(),
                    id,
                    fields,
                })
            }
            StreamEvent::Mutation(snapshot) => {
                let id = id_fn(&snapshot);
                let fields = fields_fn(&snapshot);
                let diff = match rendered.get(&id) {
                    Some(previous) => diff_fields(previous, &fields),
                    None => fields.clone(),
                };
                rendered.insert(id.clone(), fields);
                (!diff.is_empty()).then(|| SubscriptionEvent::Changed {
                    collection: collection.clone(),
                    id,
                    fields: diff,
                })
            }
            StreamEvent::Deletion(snapshot) => {
                let id = id_fn(&snapshot);
                rendered.remove(&id);
                Some(SubscriptionEvent::Removed {
                    collection: collection.clone(),
                    id,
                })
            }
            StreamEvent::InSync => Some(SubscriptionEvent::Ready),
            StreamEvent::LostSync => Some(SubscriptionEvent::NoSub { error: None }),
            StreamEvent::Error(message) => Some(SubscriptionEvent::NoSub {
                error: Some(message),
            }),
            StreamEvent::Bookmark => None,
        };
        future::ready(out)
    })
}

/// Render entities keyed by `metadata.name`, with the whole entity as fields
pub fn render_entities<S>(stream: S, collection: impl Into<String>) -> SubscriptionSource
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    let collection: String = collection.into();
    render_event_stream(
        stream,
        collection,
        |entity: &Entity| entity.name().to_string(),
        Entity::to_fields,
    )
    .boxed()
}

fn diff_fields(previous: &DocumentFields, next: &DocumentFields) -> DocumentFields {
    let mut diff: DocumentFields = next
        .iter()
        .filter(|(key, value)| previous.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for key in previous.keys() {
        if !next.contains_key(key) {
            diff.insert(key.clone(), EJson::Undefined);
        }
    }
    diff
}

/// Drive `sources` into `sub` until the subscription stops
///
/// `ready` is sent once every source has reported ready (at once when there
/// are no sources). A source ending with an error stops the subscription
/// with that error; one ending cleanly stops it plainly.
pub async fn emit_to_sub(sub: SubscriptionHandle, sources: Vec<SubscriptionSource>) -> RealtimeResult<()> {
    let total = sources.len();
    if total == 0 {
        sub.ready()?;
    }

    let mut merged = stream::select_all(
        sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| source.map(move |event| (index, event)).boxed()),
    );
    let mut ready_sources: HashSet<usize> = HashSet::new();
    let signal = sub.signal();

    loop {
        let next = tokio::select! {
            _ = signal.cancelled() => break,
            next = merged.next() => next,
        };
        let Some((index, event)) = next else {
            break;
        };

        match event {
            SubscriptionEvent::Added { collection, id, fields } => sub.added(&collection, &id, fields)?,
            SubscriptionEvent::Changed { collection, id, fields } => {
                sub.changed(&collection, &id, fields)?
            }
            SubscriptionEvent::Removed { collection, id } => sub.removed(&collection, &id)?,
            SubscriptionEvent::Ready => {
                if ready_sources.insert(index) && ready_sources.len() == total {
                    sub.ready()?;
                }
            }
            SubscriptionEvent::NoSub { error: Some(message) } => {
                sub.error(HandlerError::internal(message));
                break;
            }
            SubscriptionEvent::NoSub { error: None } => {
                sub.stop();
                break;
            }
        }
    }

    debug!(sub_id = %sub.id(), "livedata emitter finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(name: &str, done: bool) -> Entity {
        Entity::new("tasks.example.com/v1", "Task", name).with_field("done", json!(done))
    }

    fn open_tasks(entity: &Entity) -> bool {
        entity.body.get("done") == Some(&json!(false))
    }

    #[tokio::test]
    async fn test_filter_synthesizes_transitions() {
        let events = stream::iter(vec![
            StreamEvent::Creation(task("a", false)),
            StreamEvent::Creation(task("b", true)),
            StreamEvent::InSync,
            StreamEvent::Mutation(task("a", true)),
            StreamEvent::Mutation(task("b", false)),
            StreamEvent::Mutation(task("c", true)),
            StreamEvent::Deletion(task("a", true)),
            StreamEvent::Deletion(task("b", false)),
        ]);

        let out: Vec<StreamEvent> = filter_event_stream(events, open_tasks).collect().await;
        assert_eq!(
            out,
            vec![
                StreamEvent::Creation(task("a", false)),
                StreamEvent::InSync,
                StreamEvent::Deletion(task("a", true)),
                StreamEvent::Creation(task("b", false)),
                StreamEvent::Deletion(task("b", false)),
            ]
        );
    }

    #[tokio::test]
    async fn test_filter_repeated_creation_becomes_mutation() {
        let events = stream::iter(vec![
            StreamEvent::Creation(task("a", false)),
            StreamEvent::Creation(task("a", false)),
            StreamEvent::Creation(task("a", true)),
            StreamEvent::Creation(task("a", false)),
        ]);

        let out: Vec<StreamEvent> = filter_event_stream(events, open_tasks).collect().await;
        assert_eq!(
            out,
            vec![
                StreamEvent::Creation(task("a", false)),
                StreamEvent::Mutation(task("a", false)),
                StreamEvent::Deletion(task("a", true)),
                StreamEvent::Creation(task("a", false)),
            ]
        );
    }

    #[tokio::test]
    async fn test_render_diffs_mutations() {
        let mut before = DocumentFields::new();
        before.insert("x".into(), 1.into());
        before.insert("y".into(), 2.into());
        let mut after = DocumentFields::new();
        after.insert("x".into(), 1.into());
        after.insert("z".into(), 3.into());

        let events = stream::iter(vec![
            StreamEvent::Creation(before.clone()),
            StreamEvent::Mutation(before.clone()),
            StreamEvent::Mutation(after.clone()),
            StreamEvent::Bookmark,
            StreamEvent::InSync,
            StreamEvent::Deletion(after),
            StreamEvent::Error("gone".into()),
        ]);

        let out: Vec<SubscriptionEvent> = render_event_stream(
            events,
            "docs",
            |_: &DocumentFields| "d".to_string(),
            |fields: &DocumentFields| fields.clone(),
        )
        .collect()
        .await;

        let mut expected_diff = DocumentFields::new();
        expected_diff.insert("y".into(), EJson::Undefined);
        expected_diff.insert("z".into(), 3.into());
        assert_eq!(
            out,
            vec![
                SubscriptionEvent::Added { collection: "docs".into(), id: "d".into(), fields: before },
                SubscriptionEvent::Changed {
                    collection: "docs".into(),
                    id: "d".into(),
                    fields: expected_diff,
                },
                SubscriptionEvent::Ready,
                SubscriptionEvent::Removed { collection: "docs".into(), id: "d".into() },
                SubscriptionEvent::NoSub { error: Some("gone".into()) },
            ]
        );
    }

    #[tokio::test]
    async fn test_lost_sync_renders_plain_nosub() {
        let events = stream::iter(vec![StreamEvent::<Entity>::LostSync]);
        let collection = String::from("tasks");
        let source: SubscriptionSource = render_entities(events, collection.as_str());
        drop(collection);
        let out: Vec<SubscriptionEvent> = source.collect().await;
        assert_eq!(out, vec![SubscriptionEvent::NoSub { error: None }]);
    }
}
