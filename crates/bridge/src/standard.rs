//! Generic bridge over a [`SourceAdapter`] and a [`DestinationClient`].
//!
//! Every destination call goes through the shared [`Throttle`] and the
//! [`CredentialBroker`]'s `with_token`, so an expired token is refreshed and
//! the call retried once before the job sees an error.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use mirrorline_core::{
    Bridge, DestinationId, ErrorClass, MirrorError, MirrorResult, MirroredItem, PlatformPair,
    Principal, RepliesReport, SourceId,
};
use mirrorline_infra::credentials::CredentialBroker;
use mirrorline_infra::mapping::MappingCache;
use mirrorline_infra::throttle::Throttle;

use crate::destination::{DestinationClient, DestinationError};
use crate::source::{SourceAdapter, SourceReply};

/// Static bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub pair: PlatformPair,
    /// Destination account used for every write.
    pub principal: Principal,
    /// Source community → destination community. Communities without an
    /// entry map to their lowercased name.
    pub communities: HashMap<String, String>,
}

impl BridgeSettings {
    pub fn new(principal: impl Into<Principal>) -> Self {
        Self {
            pair: PlatformPair::default(),
            principal: principal.into(),
            communities: HashMap::new(),
        }
    }

    pub fn with_pair(mut self, pair: PlatformPair) -> Self {
        self.pair = pair;
        self
    }

    pub fn with_community(mut self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        self.communities
            .insert(source.into().to_lowercase(), destination.into());
        self
    }

    /// Destination community name for a source community.
    pub fn destination_community(&self, source: &str) -> String {
        let key = source.to_lowercase();
        self.communities.get(&key).cloned().unwrap_or(key)
    }
}

pub struct StandardBridge {
    settings: BridgeSettings,
    source: Arc<dyn SourceAdapter>,
    destination: Arc<dyn DestinationClient>,
    broker: Arc<CredentialBroker>,
    mappings: Arc<dyn MappingCache>,
    throttle: Arc<Throttle>,
    /// Resolved destination community ids, by destination community name.
    contexts: Mutex<HashMap<String, String>>,
}

impl StandardBridge {
    pub fn new(
        settings: BridgeSettings,
        source: Arc<dyn SourceAdapter>,
        destination: Arc<dyn DestinationClient>,
        broker: Arc<CredentialBroker>,
        mappings: Arc<dyn MappingCache>,
        throttle: Arc<Throttle>,
    ) -> Self {
        Self {
            settings,
            source,
            destination,
            broker,
            mappings,
            throttle,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Run a destination call with a valid token, after the throttle.
    async fn authorized<T, F, Fut>(&self, op: F) -> MirrorResult<T>
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, DestinationError>> + Send,
        T: Send,
    {
        self.broker
            .with_token(&self.settings.principal, |token| {
                let call = op(token);
                async move {
                    self.throttle.wait().await;
                    call.await.map_err(MirrorError::from)
                }
            })
            .await
    }

    fn cached_context(&self, community: &str) -> Option<String> {
        self.contexts
            .lock()
            .ok()
            .and_then(|contexts| contexts.get(community).cloned())
    }

    async fn context_for(&self, source_community: &str) -> MirrorResult<String> {
        let community = self.settings.destination_community(source_community);
        if let Some(context) = self.cached_context(&community) {
            return Ok(context);
        }

        let destination = self.destination.as_ref();
        let name = community.as_str();
        let context = self
            .authorized(|token| async move { destination.resolve_context(&token, name).await })
            .await?;
        debug!(community = %community, context = %context, "destination community resolved");
        if let Ok(mut contexts) = self.contexts.lock() {
            contexts.insert(community, context.clone());
        }
        Ok(context)
    }
}

/// Order replies so every parent in the set comes before its children.
fn parents_first(replies: Vec<SourceReply>) -> Vec<SourceReply> {
    let parents: HashMap<SourceId, Option<SourceId>> = replies
        .iter()
        .map(|r| (r.id.clone(), r.parent_id.clone()))
        .collect();

    let depth = |reply: &SourceReply| {
        let mut depth = 0usize;
        let mut seen = HashSet::new();
        let mut current = reply.parent_id.clone();
        while let Some(id) = current {
            if !seen.insert(id.clone()) {
                break;
            }
            match parents.get(&id) {
                Some(parent) => {
                    depth += 1;
                    current = parent.clone();
                }
                None => break,
            }
        }
        depth
    };

    let mut ordered: Vec<(usize, SourceReply)> = replies.into_iter().map(|r| (depth(&r), r)).collect();
    ordered.sort_by_key(|(depth, _)| *depth);
    ordered.into_iter().map(|(_, reply)| reply).collect()
}

#[async_trait]
impl Bridge for StandardBridge {
    fn pair(&self) -> PlatformPair {
        self.settings.pair
    }

    async fn mirror_item(&self, source_id: &SourceId) -> MirrorResult<MirroredItem> {
        let item = self.source.fetch_item(source_id).await?;
        let context = self.context_for(&item.community).await?;

        let destination = self.destination.as_ref();
        let (item_ref, context_ref) = (&item, context.as_str());
        let destination_id = self
            .authorized(|token| async move {
                destination.create_item(&token, item_ref, context_ref).await
            })
            .await?;

        info!(
            pair = %self.settings.pair,
            source_id = %source_id,
            destination_id = %destination_id,
            community = %item.community,
            "destination item created"
        );
        Ok(MirroredItem {
            destination_id,
            context: Some(context),
        })
    }

    async fn resync_item(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> MirrorResult<MirroredItem> {
        let item = self.source.fetch_item(source_id).await?;

        let destination = self.destination.as_ref();
        let item_ref = &item;
        self.authorized(|token| async move {
            destination.update_item(&token, destination_id, item_ref).await
        })
        .await?;

        info!(source_id = %source_id, destination_id = %destination_id, "destination item updated");
        Ok(MirroredItem {
            destination_id: destination_id.clone(),
            context: None,
        })
    }

    async fn mirror_replies(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> MirrorResult<RepliesReport> {
        let pair = self.settings.pair;
        if self.mappings.get(pair, source_id).await?.is_none() {
            return Err(MirrorError::transient(format!(
                "parent item {source_id} has no mapping yet"
            )));
        }

        let replies = parents_first(self.source.fetch_replies(source_id).await?);
        let mut report = RepliesReport::default();
        let mut resolved: HashMap<SourceId, DestinationId> = HashMap::new();
        let mut unresolvable: HashSet<SourceId> = HashSet::new();

        for reply in &replies {
            if self.mappings.is_ignored(&reply.id).await? {
                unresolvable.insert(reply.id.clone());
                report.skipped += 1;
                continue;
            }
            if let Some(existing) = self.mappings.get(pair, &reply.id).await? {
                resolved.insert(reply.id.clone(), existing);
                report.already_mirrored += 1;
                continue;
            }

            let parent = match &reply.parent_id {
                None => None,
                Some(parent) if parent == source_id => None,
                Some(parent) => match resolved.get(parent) {
                    Some(id) => Some(id.clone()),
                    None if unresolvable.contains(parent) => {
                        unresolvable.insert(reply.id.clone());
                        report.skipped += 1;
                        continue;
                    }
                    // Parent outside this listing; it may have been mirrored
                    // by an earlier pass.
                    None => match self.mappings.get(pair, parent).await? {
                        Some(id) => Some(id),
                        None => {
                            warn!(source_id = %source_id, reply_id = %reply.id, parent_id = %parent, "reply parent missing, skipping");
                            unresolvable.insert(reply.id.clone());
                            report.skipped += 1;
                            continue;
                        }
                    },
                },
            };

            let destination = self.destination.as_ref();
            let parent_ref = parent.as_ref();
            let created = match self
                .authorized(|token| async move {
                    destination
                        .create_reply(&token, destination_id, parent_ref, reply)
                        .await
                })
                .await
            {
                Ok(created) => created,
                // A refused reply takes its subtree with it; the rest of the
                // thread still goes through.
                Err(err) if err.class() == ErrorClass::Permanent => {
                    warn!(source_id = %source_id, reply_id = %reply.id, error = %err, "reply refused by destination, skipping");
                    unresolvable.insert(reply.id.clone());
                    report.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.mappings
                .put(pair, &reply.id, &created, Some(destination_id.as_str()))
                .await?;
            resolved.insert(reply.id.clone(), created);
            report.created += 1;
        }

        debug!(
            source_id = %source_id,
            total = replies.len(),
            created = report.created,
            "reply thread processed"
        );
        Ok(report)
    }

    async fn discover(&self, community: &str, limit: usize) -> MirrorResult<Vec<SourceId>> {
        Ok(self.source.list_recent(community, limit).await?)
    }
}

impl std::fmt::Debug for StandardBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardBridge")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
