// Admin checks with a short-lived cache.
//
// Every group message needs an "is the sender an admin?" answer, so lookups
// are cached per (chat, user) for a few seconds instead of hitting
// getChatMember each time.

use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use teloxide::prelude::*;

pub struct AdminCache {
    ttl: Duration,
    owners: HashSet<u64>,
    entries: DashMap<(i64, u64), (bool, Instant)>,
}

impl AdminCache {
    pub fn new(ttl: Duration, owners: impl IntoIterator<Item = u64>) -> Self {
        Self {
            ttl,
            owners: owners.into_iter().collect(),
            entries: DashMap::new(),
        }
    }

    /// Bot owners count as admins everywhere.
    pub fn is_owner(&self, user_id: u64) -> bool {
        self.owners.contains(&user_id)
    }

    fn cached(&self, chat_id: i64, user_id: u64) -> Option<bool> {
        let entry = self.entries.get(&(chat_id, user_id))?;
        let (is_admin, at) = *entry;
        (at.elapsed() < self.ttl).then_some(is_admin)
    }

    fn remember(&self, chat_id: i64, user_id: u64, is_admin: bool) {
        self.entries
            .insert((chat_id, user_id), (is_admin, Instant::now()));
    }

    /// Drop stale entries; called from the sweep loop.
    pub fn prune(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (_, at)| at.elapsed() < ttl);
    }

    /// Whether `user` is an owner, creator or administrator of `chat`.
    /// A failed lookup counts as "not an admin" and is not cached.
    pub async fn is_admin(&self, bot: &Bot, chat: ChatId, user: UserId) -> bool {
        if self.is_owner(user.0) {
            return true;
        }
        if let Some(is_admin) = self.cached(chat.0, user.0) {
            return is_admin;
        }

        match bot.get_chat_member(chat, user).await {
            Ok(member) => {
                let is_admin = member.kind.is_privileged();
                self.remember(chat.0, user.0, is_admin);
                is_admin
            }
            Err(e) => {
                tracing::warn!(chat_id = chat.0, user_id = user.0, error = %e, "Admin lookup failed");
                false
            }
        }
    }
}
