//! Label Registry: user id ↔ integer label, derived from the Sample Store.
//!
//! Labels are the positions of users in sorted order, so the mapping is a
//! pure function of which users currently have samples.

use crate::store::{SampleStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelRegistry {
    users: Vec<String>,
}

impl LabelRegistry {
    /// Build from an arbitrary list of user ids (sorted and deduplicated).
    pub fn from_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut users: Vec<String> = users.into_iter().map(Into::into).collect();
        users.sort();
        users.dedup();
        Self { users }
    }

    /// Snapshot the users that currently have at least one sample.
    pub fn from_store(store: &SampleStore) -> Result<Self, StoreError> {
        Ok(Self::from_users(store.users()?))
    }

    pub fn label_of(&self, user_id: &str) -> Option<i32> {
        self.users
            .binary_search_by(|u| u.as_str().cmp(user_id))
            .ok()
            .map(|idx| idx as i32)
    }

    pub fn user_of(&self, label: i32) -> Option<&str> {
        usize::try_from(label)
            .ok()
            .and_then(|idx| self.users.get(idx))
            .map(String::as_str)
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
