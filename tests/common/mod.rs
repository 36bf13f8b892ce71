//! Shared fixtures: small helpers for assembling test entries and running
//! the whole pipeline to text.

use gmdcmp::bytecode::builder::StreamBuilder;
use gmdcmp::bytecode::{CodeEntry, DataType, InstanceType};
use gmdcmp::Settings;

pub fn decompiled(entry: &CodeEntry) -> String {
    gmdcmp::decompile_to_string(entry, &Settings::default())
        .expect("decompilation should succeed")
}

/// `name = value` on self, as an Int32 constant.
pub fn assign_int(b: &mut StreamBuilder, name: &str, value: i32) {
    b.push_i32(value)
        .pop_var(InstanceType::SelfInstance, name, DataType::Int32);
}

/// `name = "value"` on self.
pub fn assign_str(b: &mut StreamBuilder, name: &str, value: &str) {
    b.push_string(value)
        .pop_var(InstanceType::SelfInstance, name, DataType::String);
}

/// Pushes `self.<name>` and converts it to a boolean, the way compiled
/// conditions open.
pub fn test_var(b: &mut StreamBuilder, name: &str) {
    b.push_var(InstanceType::SelfInstance, name)
        .convert(DataType::Variable, DataType::Boolean);
}
