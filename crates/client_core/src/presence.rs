use std::fmt::Display;

use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{PeerUser, Username},
    protocol::UserStatus,
};

/// Known counterparts in the order the service listed them.
#[derive(Debug, Default, Clone)]
pub struct Roster {
    users: Vec<PeerUser>,
}

impl Roster {
    pub fn replace(&mut self, users: Vec<PeerUser>) {
        self.users = users;
    }

    pub fn users(&self) -> &[PeerUser] {
        &self.users
    }

    pub fn get(&self, username: &Username) -> Option<&PeerUser> {
        self.users.iter().find(|user| &user.username == username)
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    /// Applies a presence change, adding the user if the roster has not seen it yet.
    pub fn apply_status(&mut self, status: &UserStatus, received_at: DateTime<Utc>) -> PeerUser {
        let index = match self
            .users
            .iter()
            .position(|user| user.username == status.username)
        {
            Some(index) => index,
            None => {
                self.users.push(PeerUser::offline(status.username.clone()));
                self.users.len() - 1
            }
        };
        let user = &mut self.users[index];
        user.is_online = status.is_online;
        if let Some(last_seen) = status.last_seen {
            user.last_seen_at = Some(last_seen);
        } else if !status.is_online {
            user.last_seen_at = Some(received_at);
        }
        user.clone()
    }
}

pub fn presence_label<Tz>(user: &PeerUser, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if user.is_online {
        return "Online now".to_string();
    }
    let Some(last_seen) = user.last_seen_at else {
        return "Never active".to_string();
    };

    let last_seen = last_seen.with_timezone(&now.timezone());
    let elapsed_minutes = now
        .clone()
        .signed_duration_since(last_seen.clone())
        .num_minutes();
    if elapsed_minutes < 1 {
        "Just now".to_string()
    } else if elapsed_minutes < 60 {
        format!("Active {elapsed_minutes} min ago")
    } else if last_seen.date_naive() == now.date_naive() {
        format!("Active today at {}", last_seen.format("%H:%M"))
    } else {
        format!("Active on {}", last_seen.format("%b %-d, %Y"))
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
