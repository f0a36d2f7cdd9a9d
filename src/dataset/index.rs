//! Dense string-to-integer index arena.
//!
//! Names are assigned consecutive `i32` indexes so vectors, bitsets and
//! adjacency arrays can use direct array indexing. `NOT_ID` marks an absent
//! name without a nullable wrapper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const NOT_ID: i32 = -1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapIndex {
    numbers: HashMap<String, i32>,
    names: Vec<String>,
}

impl MapIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next dense index to `name`, or return the existing one.
    pub fn add(&mut self, name: &str) -> i32 {
        if let Some(&number) = self.numbers.get(name) {
            return number;
        }
        let number = self.names.len() as i32;
        self.numbers.insert(name.to_string(), number);
        self.names.push(name.to_string());
        number
    }

    /// `NOT_ID` when the name was never added.
    pub fn to_number(&self, name: &str) -> i32 {
        self.numbers.get(name).copied().unwrap_or(NOT_ID)
    }

    /// `number` must have been issued by this index.
    pub fn to_name(&self, number: i32) -> &str {
        &self.names[number as usize]
    }

    pub fn len(&self) -> i32 {
        self.names.len() as i32
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
