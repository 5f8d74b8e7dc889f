//! Content block lifecycle tracking
//!
//! A block is opened when the session issues its content start, becomes
//! active once payload flows, and is ended when the session issues its
//! content end. Ended blocks are kept until the engine reports `contentEnd`
//! for the same id, matched by id because the engine may finish blocks out
//! of issue order.

use std::collections::HashMap;

use crate::events::Role;
use crate::{Error, Result};

/// Modality of a content block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Audio,
    Text,
}

/// Lifecycle state of a content block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Started,
    Active,
    Ended,
}

/// A content block issued by the session
#[derive(Debug, Clone, PartialEq)]
pub struct ContentBlock {
    pub id: String,
    pub modality: Modality,
    pub role: Role,
    pub state: BlockState,
}

impl ContentBlock {
    pub fn is_open(&self) -> bool {
        self.state != BlockState::Ended
    }
}

/// Open and not-yet-acknowledged content blocks of one session
#[derive(Debug, Default)]
pub struct ContentTracker {
    blocks: HashMap<String, ContentBlock>,
    /// Issue order, for deterministic listings
    order: Vec<String>,
}

impl ContentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a block
    ///
    /// Rejects a second open audio block and any text block while audio is
    /// open.
    pub fn open(&mut self, id: impl Into<String>, modality: Modality, role: Role) -> Result<()> {
        let id = id.into();
        if self.blocks.get(&id).is_some_and(ContentBlock::is_open) {
            return Err(Error::invalid_state(
                "open_content",
                format!("content block {} is already open", id),
            ));
        }
        if let Some(audio) = self.open_audio() {
            let reason = match modality {
                Modality::Audio => format!("audio content block {} is already open", audio),
                Modality::Text => format!("cannot inject text while audio block {} is open", audio),
            };
            return Err(Error::invalid_state("open_content", reason));
        }

        self.order.retain(|existing| existing != &id);
        self.order.push(id.clone());
        self.blocks.insert(
            id.clone(),
            ContentBlock {
                id,
                modality,
                role,
                state: BlockState::Started,
            },
        );
        Ok(())
    }

    /// Mark a started block as carrying payload
    pub fn mark_active(&mut self, id: &str) -> Result<()> {
        match self.blocks.get_mut(id) {
            Some(block) if block.is_open() => {
                block.state = BlockState::Active;
                Ok(())
            }
            Some(_) => Err(Error::invalid_state(
                "mark_active",
                format!("content block {} has ended", id),
            )),
            None => Err(Error::invalid_state(
                "mark_active",
                format!("unknown content block {}", id),
            )),
        }
    }

    /// End a block from the session side; returns false if it was not open
    pub fn end(&mut self, id: &str) -> bool {
        match self.blocks.get_mut(id) {
            Some(block) if block.is_open() => {
                block.state = BlockState::Ended;
                true
            }
            _ => false,
        }
    }

    /// Forget a block once the engine reported its `contentEnd`
    ///
    /// A block still open on our side is ended first; the engine has
    /// finished consuming it either way.
    pub fn acknowledge(&mut self, id: &str) -> Option<ContentBlock> {
        let mut block = self.blocks.remove(id)?;
        self.order.retain(|existing| existing != id);
        block.state = BlockState::Ended;
        Some(block)
    }

    /// Id of the open audio block, if any
    pub fn open_audio(&self) -> Option<&str> {
        self.order
            .iter()
            .filter_map(|id| self.blocks.get(id))
            .find(|b| b.modality == Modality::Audio && b.is_open())
            .map(|b| b.id.as_str())
    }

    pub fn has_open(&self) -> bool {
        self.blocks.values().any(ContentBlock::is_open)
    }

    pub fn open_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.blocks.get(*id).is_some_and(ContentBlock::is_open))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&ContentBlock> {
        self.blocks.get(id)
    }

    /// Blocks ended by us but not yet acknowledged by the engine
    pub fn awaiting_ack(&self) -> usize {
        self.blocks.values().filter(|b| !b.is_open()).count()
    }

    /// Drop everything (new prompt or teardown)
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.order.clear();
    }
}
