use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{ClientInfo, RoomSummary};

const LOG_TAG: &str = "[Party Relay]";
const MAX_ROOM_ID_LEN: usize = 64;

/// Shared relay state. Rooms exist only while they have members.
#[derive(Clone, Default)]
pub struct ServerState {
    /// All connected clients: client_id -> ClientInfo
    pub clients: Arc<DashMap<Uuid, ClientInfo>>,
    /// Room membership: room_id -> Vec<client_id>
    pub room_members: Arc<DashMap<String, Arc<RwLock<Vec<Uuid>>>>>,
}

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Room the client left to join this one, if any
    pub previous_room: Option<String>,
    /// Members present before this client arrived
    pub existing_members: Vec<Uuid>,
    /// Member count including the joiner
    pub members: usize,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join_room(&self, client_id: Uuid, room_id: &str) -> Result<JoinOutcome, String> {
        let room_id = Self::normalize_room_id(room_id)?;

        let current = self.clients.get(&client_id).and_then(|c| c.room_id.clone());
        let previous_room = match current {
            Some(existing) if existing == room_id => None,
            Some(_) => self.leave_room(client_id).await,
            None => None,
        };

        let (existing_members, members) = loop {
            // Rooms are created implicitly by their first member
            let members_lock = Arc::clone(
                &*self
                    .room_members
                    .entry(room_id.clone())
                    .or_insert_with(|| Arc::new(RwLock::new(Vec::new()))),
            );
            let mut members = members_lock.write().await;

            // An emptied room is unlinked under its write lock; retry on a fresh one
            let live = self
                .room_members
                .get(&room_id)
                .is_some_and(|entry| Arc::ptr_eq(&*entry, &members_lock));
            if !live {
                continue;
            }

            let existing: Vec<Uuid> = members
                .iter()
                .copied()
                .filter(|id| *id != client_id)
                .collect();
            if !members.contains(&client_id) {
                members.push(client_id);
            }
            break (existing, members.len());
        };

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.room_id = Some(room_id.clone());
        }

        tracing::info!(
            "{LOG_TAG} Client {} joined room {} ({} members)",
            client_id,
            room_id,
            members
        );
        Ok(JoinOutcome {
            previous_room,
            existing_members,
            members,
        })
    }

    pub async fn leave_room(&self, client_id: Uuid) -> Option<String> {
        let room_id = self.clients.get(&client_id).and_then(|c| c.room_id.clone())?;

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.room_id = None;
        }

        let members_lock = self
            .room_members
            .get(&room_id)
            .map(|entry| Arc::clone(&*entry));

        if let Some(members_lock) = members_lock {
            let mut members = members_lock.write().await;
            members.retain(|id| *id != client_id);

            if members.is_empty() {
                self.room_members
                    .remove_if(&room_id, |_, lock| Arc::ptr_eq(lock, &members_lock));
                drop(members);
                tracing::info!("{LOG_TAG} Room {} deleted (empty)", room_id);
                return Some(room_id);
            }
        }

        tracing::info!("{LOG_TAG} Client {} left room {}", client_id, room_id);
        Some(room_id)
    }

    pub async fn get_room_members(&self, room_id: &str) -> Vec<Uuid> {
        if let Some(members_ref) = self.room_members.get(room_id) {
            let members_lock = Arc::clone(&*members_ref);
            drop(members_ref);
            let members = members_lock.read().await;
            members.clone()
        } else {
            Vec::new()
        }
    }

    /// Room the client currently belongs to
    pub fn room_of(&self, client_id: Uuid) -> Option<String> {
        self.clients.get(&client_id).and_then(|c| c.room_id.clone())
    }

    pub fn add_client(&self, client_id: Uuid) {
        self.clients.insert(client_id, ClientInfo::default());
        tracing::info!("{LOG_TAG} Client {} connected", client_id);
    }

    pub async fn remove_client(&self, client_id: Uuid) -> Option<String> {
        let left = self.leave_room(client_id).await;
        self.clients.remove(&client_id);
        tracing::info!("{LOG_TAG} Client {} disconnected", client_id);
        left
    }

    pub async fn room_summaries(&self) -> Vec<RoomSummary> {
        let locks: Vec<(String, Arc<RwLock<Vec<Uuid>>>)> = self
            .room_members
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut summaries = Vec::with_capacity(locks.len());
        for (room_id, lock) in locks {
            let members = lock.read().await.len();
            summaries.push(RoomSummary { room_id, members });
        }
        summaries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        summaries
    }

    fn normalize_room_id(raw: &str) -> Result<String, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("Room id must not be empty".to_string());
        }
        if trimmed.len() > MAX_ROOM_ID_LEN || trimmed.chars().any(|ch| ch.is_control()) {
            return Err("Room id is invalid".to_string());
        }
        Ok(trimmed.to_string())
    }
}
