// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The cache-awareness tree backing `Policy::CacheAware`: a radix-like
//! approximation of which token-id prefix is cached on which worker.
//!
//! Descent operates on fixed-size *blocks* of the token sequence (chunks of
//! `block_size` token ids, hashed with xxhash) rather than per-token nodes —
//! this is how the SGLang/Dynamo radix-cache approximation this is modeled
//! on actually works, and keeps tree depth bounded by
//! `prompt_len / block_size` rather than by prompt length.
//!
//! A strict tree with node-owned children and parent back-indices (arena +
//! index) avoids reference cycles; nodes are never physically removed from
//! the arena, only tombstoned, so child indices stay valid across eviction.

use std::collections::{BTreeSet, HashMap};

use xxhash_rust::xxh3::xxh3_64;

use crate::WorkerId;

type BlockHash = u64;

const ROOT: usize = 0;

#[derive(Debug)]
struct Node {
    children: HashMap<BlockHash, usize>,
    workers: BTreeSet<WorkerId>,
    last_touched_ms: i64,
    parent: Option<usize>,
    alive: bool,
}

impl Node {
    fn root() -> Self {
        Self {
            children: HashMap::new(),
            workers: BTreeSet::new(),
            last_touched_ms: 0,
            parent: None,
            alive: true,
        }
    }
}

pub struct DescendResult {
    pub matched_blocks: usize,
    pub candidate_workers: BTreeSet<WorkerId>,
}

pub struct CacheTree {
    nodes: Vec<Node>,
    max_size: usize,
    block_size: usize,
}

impl CacheTree {
    pub fn new(max_size: usize, block_size: usize) -> Self {
        Self {
            nodes: vec![Node::root()],
            max_size: max_size.max(1),
            block_size: block_size.max(1),
        }
    }

    fn hash_blocks(&self, token_ids: &[u32]) -> Vec<BlockHash> {
        token_ids
            .chunks(self.block_size)
            .map(|chunk| {
                let bytes: Vec<u8> = chunk.iter().flat_map(|t| t.to_le_bytes()).collect();
                xxh3_64(&bytes)
            })
            .collect()
    }

    /// Descends along `token_ids` until divergence, returning the deepest
    /// node's worker bitset as the cache-candidate set.
    pub fn descend(&self, token_ids: &[u32]) -> DescendResult {
        let blocks = self.hash_blocks(token_ids);
        let mut idx = ROOT;
        let mut matched = 0usize;
        for block in &blocks {
            let Some(&next) = self.nodes[idx].children.get(block) else {
                break;
            };
            if !self.nodes[next].alive {
                break;
            }
            idx = next;
            matched += 1;
        }
        DescendResult {
            matched_blocks: matched,
            candidate_workers: self.nodes[idx].workers.clone(),
        }
    }

    /// Inserts `token_ids` with `worker_id`'s bit set at each node along the
    /// path, creating nodes as needed, then evicts least-recently-touched
    /// leaves until back within `max_size`.
    pub fn insert(&mut self, token_ids: &[u32], worker_id: WorkerId, now_ms: i64) {
        let blocks = self.hash_blocks(token_ids);
        let mut idx = ROOT;
        self.nodes[idx].last_touched_ms = now_ms;
        for block in blocks {
            idx = match self.nodes[idx].children.get(&block) {
                Some(&next) if self.nodes[next].alive => next,
                _ => {
                    let new_idx = self.nodes.len();
                    self.nodes.push(Node {
                        children: HashMap::new(),
                        workers: BTreeSet::new(),
                        last_touched_ms: now_ms,
                        parent: Some(idx),
                        alive: true,
                    });
                    self.nodes[idx].children.insert(block, new_idx);
                    new_idx
                }
            };
            self.nodes[idx].workers.insert(worker_id);
            self.nodes[idx].last_touched_ms = now_ms;
        }
        self.evict_to_budget();
    }

    fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.alive).count()
    }

    fn is_live_leaf(&self, idx: usize) -> bool {
        idx != ROOT
            && self.nodes[idx].alive
            && self.nodes[idx]
                .children
                .values()
                .all(|&child| !self.nodes[child].alive)
    }

    fn oldest_live_leaf(&self) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.is_live_leaf(*idx))
            .min_by_key(|(_, node)| node.last_touched_ms)
            .map(|(idx, _)| idx)
    }

    fn remove_node(&mut self, idx: usize) {
        let parent = self.nodes[idx].parent;
        self.nodes[idx].alive = false;
        self.nodes[idx].workers.clear();
        self.nodes[idx].children.clear();
        if let Some(parent) = parent {
            self.nodes[parent].children.retain(|_, &mut child| child != idx);
        }
    }

    fn evict_to_budget(&mut self) {
        while self.live_count() > self.max_size {
            match self.oldest_live_leaf() {
                Some(idx) => self.remove_node(idx),
                None => break,
            }
        }
    }

    /// Periodic eviction tick (§4.4.3 step 6): evicts leaf subtrees whose
    /// last-touch timestamp is older than `cutoff_ms`, repeatedly — once a
    /// subtree's children are gone it becomes a leaf itself and is eligible
    /// next pass.
    pub fn evict_older_than(&mut self, cutoff_ms: i64) {
        loop {
            let victim = self.nodes.iter().enumerate().find(|(idx, node)| {
                self.is_live_leaf(*idx) && node.last_touched_ms < cutoff_ms
            });
            match victim {
                Some((idx, _)) => self.remove_node(idx),
                None => break,
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.live_count()
    }
}
