use std::collections::BTreeSet;

use shared::domain::UserId;

/// Online-user set. Every operation reports whether the set changed.
#[derive(Debug, Default, Clone)]
pub struct OnlineUsers {
    users: BTreeSet<UserId>,
}

impl OnlineUsers {
    pub fn add(&mut self, user: UserId) -> bool {
        self.users.insert(user)
    }

    pub fn remove(&mut self, user: &UserId) -> bool {
        self.users.remove(user)
    }

    pub fn replace_all(&mut self, users: impl IntoIterator<Item = UserId>) -> bool {
        let next: BTreeSet<UserId> = users.into_iter().collect();
        if next == self.users {
            return false;
        }
        self.users = next;
        true
    }

    pub fn to_vec(&self) -> Vec<UserId> {
        self.users.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_are_idempotent() {
        let mut online = OnlineUsers::default();
        assert!(online.add(UserId::from("a")));
        assert!(!online.add(UserId::from("a")));
        assert!(online.remove(&UserId::from("a")));
        assert!(!online.remove(&UserId::from("a")));
    }

    #[test]
    fn replace_all_reports_no_change_for_same_set() {
        let mut online = OnlineUsers::default();
        assert!(online.replace_all(vec![UserId::from("b"), UserId::from("a")]));
        assert!(!online.replace_all(vec![UserId::from("a"), UserId::from("b")]));
        assert_eq!(online.to_vec(), vec![UserId::from("a"), UserId::from("b")]);
    }
}
