//! Clients, roles and guest slots.
//!
//! A session has one owner and up to `max_active` concurrently active
//! guests. Invitations are single use: the first client to join with an
//! invitation owns it for good. A guest that goes idle loses its slot but
//! keeps its invitation, so it can take a free slot back later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::command::{Access, CommandKind};
use crate::session::SessionState;

/// Sticky identity of one browser.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuestId(pub Uuid);

impl std::fmt::Display for GuestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for GuestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Role {
    Owner,
    Guest { control: bool },
}

impl Role {
    pub fn may_send(self, kind: CommandKind) -> bool {
        match (kind.access(), self) {
            (Access::Gateway, _) => false,
            (Access::Anyone, _) => true,
            (_, Role::Owner) => true,
            (Access::Control, Role::Guest { control }) => control,
            (Access::Owner, Role::Guest { .. }) => false,
        }
    }

    pub fn is_owner(self) -> bool {
        self == Role::Owner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JoinRejection {
    #[error("session is not connected")]
    NotConnected,
    #[error("sharing is disabled for this session")]
    SharingDisabled,
    #[error("invitation not found")]
    InvitationNotFound,
    #[error("invitation already used")]
    InvitationUsed,
    #[error("all guest slots are taken")]
    SlotsExhausted,
}

impl JoinRejection {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::SharingDisabled => "sharing_disabled",
            Self::InvitationNotFound => "invitation_not_found",
            Self::InvitationUsed => "invitation_used",
            Self::SlotsExhausted => "slots_exhausted",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Guest {
    pub id: GuestId,
    pub client: Option<ClientId>,
    pub control: bool,
    pub active: bool,
    pub invited_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuestInfo {
    pub id: GuestId,
    pub control: bool,
    pub active: bool,
    pub joined: bool,
    pub invited_at: DateTime<Utc>,
}

impl From<&Guest> for GuestInfo {
    fn from(guest: &Guest) -> Self {
        Self {
            id: guest.id,
            control: guest.control,
            active: guest.active,
            joined: guest.client.is_some(),
            invited_at: guest.invited_at,
        }
    }
}

/// Outcome of looking a client up on each request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestAccess {
    Active { control: bool },
    /// Slot was freed by idleness and has just been taken back.
    Reclaimed { control: bool },
    NotAGuest,
}

pub struct GuestRoster {
    max_active: usize,
    guests: Vec<Guest>,
}

impl GuestRoster {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active,
            guests: Vec::new(),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    pub fn active_count(&self) -> usize {
        self.guests.iter().filter(|g| g.active).count()
    }

    pub fn invite(&mut self, control: bool) -> GuestId {
        let id = GuestId(Uuid::new_v4());
        self.guests.push(Guest {
            id,
            client: None,
            control,
            active: false,
            invited_at: Utc::now(),
        });
        id
    }

    pub fn join(
        &mut self,
        id: GuestId,
        client: &ClientId,
        state: SessionState,
    ) -> Result<GuestInfo, JoinRejection> {
        if state != SessionState::Connected {
            return Err(JoinRejection::NotConnected);
        }
        let has_free_slot = self.active_count() < self.max_active;
        let guest = self
            .guests
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or(JoinRejection::InvitationNotFound)?;

        if let Some(holder) = &guest.client {
            if holder != client {
                return Err(JoinRejection::InvitationUsed);
            }
            if guest.active {
                return Ok(GuestInfo::from(&*guest));
            }
        }
        if !has_free_slot {
            return Err(JoinRejection::SlotsExhausted);
        }
        guest.client = Some(client.clone());
        guest.active = true;
        Ok(GuestInfo::from(&*guest))
    }

    /// Look a client up, taking its slot back if it had gone idle.
    pub fn touch(&mut self, client: &ClientId) -> Result<GuestAccess, JoinRejection> {
        let has_free_slot = self.active_count() < self.max_active;
        let Some(guest) = self
            .guests
            .iter_mut()
            .find(|g| g.client.as_ref() == Some(client))
        else {
            return Ok(GuestAccess::NotAGuest);
        };
        if guest.active {
            return Ok(GuestAccess::Active {
                control: guest.control,
            });
        }
        if !has_free_slot {
            return Err(JoinRejection::SlotsExhausted);
        }
        guest.active = true;
        Ok(GuestAccess::Reclaimed {
            control: guest.control,
        })
    }

    /// Free the slot held by a client. Returns false if it held none.
    pub fn deactivate(&mut self, client: &ClientId) -> bool {
        match self
            .guests
            .iter_mut()
            .find(|g| g.active && g.client.as_ref() == Some(client))
        {
            Some(guest) => {
                guest.active = false;
                true
            }
            None => false,
        }
    }

    /// Clients currently holding a slot.
    pub fn active_clients(&self) -> Vec<ClientId> {
        self.guests
            .iter()
            .filter(|g| g.active)
            .filter_map(|g| g.client.clone())
            .collect()
    }

    pub fn get(&self, id: GuestId) -> Option<GuestInfo> {
        self.guests.iter().find(|g| g.id == id).map(GuestInfo::from)
    }

    pub fn set_control(&mut self, id: GuestId, control: bool) -> Option<GuestInfo> {
        let guest = self.guests.iter_mut().find(|g| g.id == id)?;
        guest.control = control;
        Some(GuestInfo::from(&*guest))
    }

    pub fn revoke(&mut self, id: GuestId) -> Option<Guest> {
        let position = self.guests.iter().position(|g| g.id == id)?;
        Some(self.guests.remove(position))
    }

    pub fn list(&self) -> Vec<GuestInfo> {
        self.guests.iter().map(GuestInfo::from).collect()
    }
}
