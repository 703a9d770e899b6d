//! Registry of pixel interface modules (PIMs).
//!
//! Registries in this domain hold tens of entries, so lookups are linear scans.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{Result, VcrtcmError};
use crate::hal::PconFuncs;
use crate::registry::lock;
use crate::types::{PconId, PimId};

/// What a PIM hands back when it creates a pcon.
pub struct PconInstance {
    pub funcs: Arc<dyn PconFuncs>,
    pub description: String,
    /// Ask the manager for a device-node minor number.
    pub wants_minor: bool,
}

/// Function table of one pixel interface module.
pub trait PimFuncs: Send + Sync {
    /// Create the consumer for a freshly reserved `pconid`.
    fn instantiate(&self, pconid: PconId, hints: u32) -> Result<PconInstance>;

    /// Tear down a pcon created by [`Self::instantiate`]. The pcon is already detached.
    fn destroy(&self, pconid: PconId);

    /// Self-test hook; `hints` has the same meaning as for `instantiate`.
    fn test(&self, _hints: u32) -> Result<()> {
        Ok(())
    }
}

/// Outcome of [`PimRegistry::register`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PimRegistration {
    Registered(PimId),
    /// The name was already registered; its function table was replaced in place.
    Replaced(PimId),
}

impl PimRegistration {
    pub fn id(self) -> PimId {
        match self {
            Self::Registered(id) | Self::Replaced(id) => id,
        }
    }
}

struct PimInfo {
    name: String,
    id: PimId,
    funcs: Arc<dyn PimFuncs>,
    pcons: Vec<PconId>,
}

/// Read-only view of a registered PIM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PimSummary {
    pub name: String,
    pub id: PimId,
    pub pcons: Vec<PconId>,
}

#[derive(Default)]
struct Pims {
    entries: Vec<PimInfo>,
    next_id: PimId,
}

#[derive(Default)]
pub struct PimRegistry {
    inner: Mutex<Pims>,
}

impl PimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, funcs: Arc<dyn PimFuncs>) -> Result<PimRegistration> {
        if name.is_empty() {
            return Err(VcrtcmError::invalid("PIM name must not be empty"));
        }
        let mut pims = lock(&self.inner);
        if let Some(info) = pims.entries.iter_mut().find(|p| p.name == name) {
            info.funcs = funcs;
            return Ok(PimRegistration::Replaced(info.id));
        }
        let id = pims.next_id;
        pims.next_id = pims.next_id.wrapping_add(1);
        pims.entries.push(PimInfo {
            name: name.to_owned(),
            id,
            funcs,
            pcons: Vec::new(),
        });
        Ok(PimRegistration::Registered(id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<(PimId, Arc<dyn PimFuncs>)> {
        lock(&self.inner)
            .entries
            .iter()
            .find(|p| p.name == name)
            .map(|p| (p.id, Arc::clone(&p.funcs)))
    }

    pub fn find_by_id(&self, id: PimId) -> Option<(String, Arc<dyn PimFuncs>)> {
        lock(&self.inner)
            .entries
            .iter()
            .find(|p| p.id == id)
            .map(|p| (p.name.clone(), Arc::clone(&p.funcs)))
    }

    pub fn summaries(&self) -> Vec<PimSummary> {
        lock(&self.inner)
            .entries
            .iter()
            .map(|p| PimSummary {
                name: p.name.clone(),
                id: p.id,
                pcons: p.pcons.clone(),
            })
            .collect()
    }

    /// Record `pconid` under the PIM registered as `id`. Fails if the PIM went away meanwhile.
    pub(crate) fn add_pcon(&self, id: PimId, pconid: PconId) -> Result<()> {
        let mut pims = lock(&self.inner);
        let info = pims
            .entries
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| VcrtcmError::PimNotFound(format!("#{id}")))?;
        info.pcons.push(pconid);
        Ok(())
    }

    pub(crate) fn remove_pcon(&self, id: PimId, pconid: PconId) {
        let mut pims = lock(&self.inner);
        if let Some(info) = pims.entries.iter_mut().find(|p| p.id == id) {
            info.pcons.retain(|&p| p != pconid);
        }
    }

    pub(crate) fn pcons_of(&self, name: &str) -> Option<Vec<PconId>> {
        lock(&self.inner)
            .entries
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.pcons.clone())
    }

    /// Drop the entry for `name`, returning its id and any pcons still recorded under it.
    pub(crate) fn remove(&self, name: &str) -> Option<(PimId, Vec<PconId>)> {
        let mut pims = lock(&self.inner);
        let idx = pims.entries.iter().position(|p| p.name == name)?;
        let info = pims.entries.remove(idx);
        Some((info.id, info.pcons))
    }

    pub(crate) fn names(&self) -> Vec<String> {
        lock(&self.inner)
            .entries
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }
}
