//! The control flow graph: a flat arena of nodes indexed by `NodeId`.
//!
//! Leaf blocks and recovered composites share one node header (address
//! range, parent, ordered edge lists). Edges always connect siblings; as
//! structure is recovered, composites replace subgraphs and the graph
//! re-levels into a hierarchy. Successor order is significant everywhere:
//! the non-branch (fall-through) edge comes before the branch edge.

pub type NodeId = usize;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogicKind {
    And,
    Or,
}

/// Statement a stripped branch stands for; emitted after the node's own
/// output when the chain is simulated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Terminator {
    Break,
    Continue,
}

/// Index range into the code entry's instruction list. Structure recovery
/// consumes instructions only at block edges, so narrowing the range is the
/// only mutation ever needed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InstrRange {
    pub start: usize,
    pub end: usize,
}

impl InstrRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[derive(Clone, Debug)]
pub struct SwitchArm {
    /// Case-value source: the compare block and the instruction sub-range
    /// that evaluates the value. `None` is the default arm.
    pub value: Option<(NodeId, InstrRange)>,
    /// Body chain head; `None` when this label falls through to the next
    /// arm's body.
    pub body: Option<NodeId>,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    /// Leaf basic block.
    Block { index: usize, instrs: InstrRange },
    /// A code entry body: the root, or a nested function/struct body.
    Fragment {
        name: Option<String>,
        head: Option<NodeId>,
    },
    /// Logical `&&`/`||` cascade; children each leave one value.
    ShortCircuit {
        kind: LogicKind,
        conditions: Vec<NodeId>,
    },
    /// Pre-test loop. `condition` is absent for `while (true)` shapes.
    WhileLoop {
        condition: Option<NodeId>,
        body: Option<NodeId>,
        negate: bool,
    },
    /// Post-test loop; the condition is evaluated at the end of the body
    /// chain and left on the stack.
    DoUntilLoop { body: NodeId, negate: bool },
    /// Counted loop; the count is left on the stack by the predecessor.
    RepeatLoop { body: NodeId },
    /// Instance-iteration loop; the target is left on the stack by the
    /// predecessor.
    WithLoop {
        body: NodeId,
        break_block: Option<NodeId>,
    },
    /// Two-armed conditional; the governing expression is left on the
    /// stack by the predecessor.
    If {
        then_head: Option<NodeId>,
        else_head: Option<NodeId>,
        negate: bool,
    },
    Switch {
        expr_block: NodeId,
        expr_range: InstrRange,
        arms: Vec<SwitchArm>,
    },
    TryCatch {
        try_head: Option<NodeId>,
        catch_head: Option<NodeId>,
        catch_variable: Option<String>,
        finally_head: Option<NodeId>,
    },
    /// Sentinel after-anchor for loops whose natural exit is synthesized.
    Empty,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub start: u32,
    pub end: u32,
    pub parent: Option<NodeId>,
    pub preds: Vec<NodeId>,
    pub succs: Vec<NodeId>,
    pub unreachable: bool,
    pub terminator: Option<Terminator>,
    pub kind: NodeKind,
}

impl Node {
    pub fn instrs(&self) -> Option<InstrRange> {
        match self.kind {
            NodeKind::Block { instrs, .. } => Some(instrs),
            _ => None,
        }
    }

    /// Last instruction index of a block, if any instruction remains.
    pub fn last_instr_index(&self) -> Option<usize> {
        self.instrs().filter(|r| !r.is_empty()).map(|r| r.end - 1)
    }
}

#[derive(Default)]
pub struct Cfg {
    nodes: Vec<Node>,
}

impl Cfg {
    pub fn new() -> Cfg {
        Cfg::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    pub fn add_block(&mut self, index: usize, start: u32, end: u32, instrs: InstrRange) -> NodeId {
        self.add_node(start, end, NodeKind::Block { index, instrs })
    }

    pub fn add_node(&mut self, start: u32, end: u32, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            start,
            end,
            parent: None,
            preds: Vec::new(),
            succs: Vec::new(),
            unreachable: false,
            terminator: None,
            kind,
        });
        self.nodes.len() - 1
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from].succs.push(to);
        self.nodes[to].preds.push(from);
    }

    /// Removes one `from -> to` edge from both sides.
    pub fn cut_edge(&mut self, from: NodeId, to: NodeId) {
        remove_one(&mut self.nodes[from].succs, to);
        remove_one(&mut self.nodes[to].preds, from);
    }

    /// Detaches every outgoing edge of `node`, branch edge first so the
    /// fall-through edge keeps its list position until it goes.
    pub fn cut_all_succs(&mut self, node: NodeId) {
        while let Some(&succ) = self.nodes[node].succs.last() {
            self.cut_edge(node, succ);
        }
    }

    /// The spec's structure-insertion helper: `composite` takes over every
    /// predecessor edge of `before` and every successor edge of `after`,
    /// and adopts `before`'s parent. Edge list order is preserved on both
    /// sides.
    pub fn insert_structure(&mut self, before: NodeId, after: NodeId, composite: NodeId) {
        let preds = std::mem::take(&mut self.nodes[before].preds);
        for &p in &preds {
            replace_one(&mut self.nodes[p].succs, before, composite);
        }
        self.nodes[composite].preds = preds;

        let succs = std::mem::take(&mut self.nodes[after].succs);
        for &s in &succs {
            replace_one(&mut self.nodes[s].preds, after, composite);
        }
        self.nodes[composite].succs = succs;

        self.nodes[composite].parent = self.nodes[before].parent;
    }

    pub fn set_parent(&mut self, child: NodeId, parent: NodeId) {
        self.nodes[child].parent = Some(parent);
    }

    /// Walks a detached sibling chain from `head`, following the sole
    /// successor of each node.
    pub fn chain(&self, head: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = Some(head);
        while let Some(id) = cur {
            out.push(id);
            if out.len() > self.nodes.len() {
                break;
            }
            cur = self.nodes[id].succs.first().copied();
        }
        out
    }

    /// Reparents every node of the chain starting at `head` to `parent`.
    pub fn reparent_chain(&mut self, head: NodeId, parent: NodeId) {
        for id in self.chain(head) {
            self.nodes[id].parent = Some(parent);
        }
    }

    /// Climbs parents until reaching the node that is a sibling of
    /// `level_of` — the ancestor living at the same hierarchical level.
    /// Used when a previously recorded node has since been swallowed by a
    /// composite.
    pub fn resolve_sibling(&self, node: NodeId, level_of: NodeId) -> NodeId {
        let level = self.nodes[level_of].parent;
        let mut cur = node;
        let mut steps = 0;
        while self.nodes[cur].parent != level {
            match self.nodes[cur].parent {
                Some(p) => cur = p,
                None => break,
            }
            steps += 1;
            if steps > self.nodes.len() {
                break;
            }
        }
        cur
    }

    /// Drops `n` instructions from the back of a block.
    pub fn shrink_back(&mut self, block: NodeId, n: usize) {
        if let NodeKind::Block { ref mut instrs, .. } = self.nodes[block].kind {
            debug_assert!(instrs.len() >= n, "shrinking block past its front");
            instrs.end -= n;
        }
    }

    /// Drops `n` instructions from the front of a block.
    pub fn shrink_front(&mut self, block: NodeId, n: usize) {
        if let NodeKind::Block { ref mut instrs, .. } = self.nodes[block].kind {
            debug_assert!(instrs.len() >= n, "shrinking block past its back");
            instrs.start += n;
        }
    }

    /// Structural well-formedness: edges connect siblings, parent links are
    /// acyclic, and every parent's address range covers its children.
    /// Returns a description of the first violation.
    pub fn verify(&self) -> Result<(), String> {
        for id in self.ids() {
            let node = &self.nodes[id];
            for &s in &node.succs {
                if self.nodes[s].parent != node.parent {
                    return Err(format!("edge {id} -> {s} crosses hierarchy levels"));
                }
                if !self.nodes[s].preds.contains(&id) {
                    return Err(format!("edge {id} -> {s} has no back link"));
                }
            }
            for &p in &node.preds {
                if !self.nodes[p].succs.contains(&id) {
                    return Err(format!("pred edge {p} -> {id} has no forward link"));
                }
            }
            if let Some(parent) = node.parent {
                let p = &self.nodes[parent];
                if node.start < p.start || node.end > p.end {
                    return Err(format!(
                        "node {id} [{}, {}) escapes parent {parent} [{}, {})",
                        node.start, node.end, p.start, p.end
                    ));
                }
            }
            let mut cur = node.parent;
            let mut steps = 0;
            while let Some(p) = cur {
                steps += 1;
                if steps > self.nodes.len() {
                    return Err(format!("parent chain of node {id} cycles"));
                }
                cur = self.nodes[p].parent;
            }
        }
        Ok(())
    }
}

fn remove_one(list: &mut Vec<NodeId>, value: NodeId) {
    if let Some(pos) = list.iter().position(|&v| v == value) {
        list.remove(pos);
    }
}

fn replace_one(list: &mut [NodeId], old: NodeId, new: NodeId) {
    if let Some(slot) = list.iter_mut().find(|v| **v == old) {
        *slot = new;
    }
}
