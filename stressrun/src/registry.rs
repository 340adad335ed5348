//! Static table of known stressors

use crate::stressor::Stressor;
use std::collections::HashSet;
use thiserror::Error;

/// Read-only table of stressors, looked up by name
#[derive(Clone, Copy)]
pub struct Registry {
    stressors: &'static [&'static dyn Stressor],
}
//
impl Registry {
    /// Wrap a static stressor table, checking that names are unique
    pub fn new(stressors: &'static [&'static dyn Stressor]) -> Result<Self, RegistryError> {
        let mut names = HashSet::new();
        for stressor in stressors {
            if !names.insert(stressor.name()) {
                return Err(RegistryError::DuplicateName(stressor.name()));
            }
        }
        Ok(Self { stressors })
    }

    /// Look up a stressor by name
    pub fn get(&self, name: &str) -> Option<&'static dyn Stressor> {
        self.stressors.iter().copied().find(|s| s.name() == name)
    }

    /// Enumerate stressors in table order
    pub fn iter(&self) -> impl Iterator<Item = &'static dyn Stressor> {
        self.stressors.iter().copied()
    }

    /// Number of stressors
    pub fn len(&self) -> usize {
        self.stressors.len()
    }

    /// Truth that the table is empty
    pub fn is_empty(&self) -> bool {
        self.stressors.is_empty()
    }
}

/// Invalid stressor table
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Two stressors have the same name
    #[error("stressor name {0:?} is used more than once")]
    DuplicateName(&'static str),
}
