//! Shared state of one decompilation: the entry being decompiled, the
//! configuration, the evolving graph, and everything the passes produce.

use crate::bytecode::CodeEntry;
use crate::decompiler::cfg::{Cfg, NodeId};
use crate::decompiler::errors::DecompileWarning;

/// Decompiler configuration. The first three fields steer the core; the
/// rest only affect the printer.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Leftover stack data at the end of a fragment is a warning when true,
    /// fatal when false.
    pub allow_leftover_data_on_stack: bool,
    /// Pre-bytecode-15 streams encode short-circuit terminators with
    /// `PushImmediate` instead of `Push`.
    pub old_bytecode: bool,
    /// GMLv2 arrays are one-dimensional; legacy bytecode flattens 2D
    /// accesses with a row stride.
    pub modern_arrays: bool,
    pub use_semicolon: bool,
    pub empty_line_around_branch_statements: bool,
    pub empty_line_before_switch_cases: bool,
    pub empty_line_after_switch_cases: bool,
    pub empty_line_around_function_declarations: bool,
    pub empty_line_around_static_initialization: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            allow_leftover_data_on_stack: true,
            old_bytecode: false,
            modern_arrays: true,
            use_semicolon: true,
            empty_line_around_branch_statements: false,
            empty_line_before_switch_cases: false,
            empty_line_after_switch_cases: false,
            empty_line_around_function_declarations: false,
            empty_line_around_static_initialization: false,
        }
    }
}

/// Everything one entry's decompilation reads and mutates. Passes run in a
/// fixed order and each one appends to its own product list.
pub struct DecompileContext<'a> {
    pub entry: &'a CodeEntry,
    pub settings: &'a Settings,
    pub cfg: Cfg,
    /// Leaf blocks in address order; indices are dense.
    pub blocks: Vec<NodeId>,
    /// The root fragment, set by the fragment pass.
    pub root: Option<NodeId>,
    pub fragments: Vec<NodeId>,
    pub short_circuits: Vec<NodeId>,
    pub loops: Vec<NodeId>,
    pub branches: Vec<NodeId>,
    pub switches: Vec<NodeId>,
    pub try_catches: Vec<NodeId>,
    pub warnings: Vec<DecompileWarning>,
}

impl<'a> DecompileContext<'a> {
    pub fn new(entry: &'a CodeEntry, settings: &'a Settings) -> DecompileContext<'a> {
        DecompileContext {
            entry,
            settings,
            cfg: Cfg::new(),
            blocks: Vec::new(),
            root: None,
            fragments: Vec::new(),
            short_circuits: Vec::new(),
            loops: Vec::new(),
            branches: Vec::new(),
            switches: Vec::new(),
            try_catches: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, warning: DecompileWarning) {
        tracing::warn!(?warning, entry = %self.entry.name, "decompile warning");
        self.warnings.push(warning);
    }
}
