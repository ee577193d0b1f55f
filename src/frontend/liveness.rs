//! Local-variable liveness, from the interpreter's point of view
//!
//! A backward data-flow fixpoint over the ordered blocks. The result is
//! used to prune frame states: a local that is provably never read again
//! can be dropped from the state propagated into a block, which shrinks
//! the graph and avoids keeping dead values alive across deoptimization
//! points. The analysis is conservative and uses no profiling input.

use super::{BlockId, BlockKind, BlockMap, UNNUMBERED};
use crate::bytecode::{opcodes::*, BytecodeStream};
use crate::pool::Method;

/// Per-block liveness sets, packed into `u64` words so any number of
/// locals is supported
pub struct LocalLiveness {
    words: usize,
    block_count: usize,
    live_in: Vec<u64>,
    live_out: Vec<u64>,
    gen: Vec<u64>,
    kill: Vec<u64>,
}

impl LocalLiveness {
    pub fn compute(method: &Method, map: &BlockMap) -> LocalLiveness {
        let words = (method.max_locals + 63) / 64;
        let block_count = map.order.len();
        let mut liveness = LocalLiveness {
            words,
            block_count,
            live_in: vec![0; words * block_count],
            live_out: vec![0; words * block_count],
            gen: vec![0; words * block_count],
            kill: vec![0; words * block_count],
        };

        for &block in &map.order {
            liveness.compute_local_effects(method, map, block);
        }
        liveness.solve(map);
        liveness
    }

    /// Is `local` live at the beginning of the block numbered `block_id`?
    ///
    /// Blocks outside the numbered range (synthetic blocks created during
    /// parsing) conservatively keep every local live.
    pub fn local_is_live_in(&self, block_id: u32, local: usize) -> bool {
        let block_id = block_id as usize;
        if block_id >= self.block_count {
            return true;
        }
        self.bit(&self.live_in, block_id, local)
    }

    pub fn local_is_live_out(&self, block_id: u32, local: usize) -> bool {
        let block_id = block_id as usize;
        if block_id >= self.block_count {
            return true;
        }
        self.bit(&self.live_out, block_id, local)
    }

    fn bit(&self, set: &[u64], block_id: usize, local: usize) -> bool {
        set[block_id * self.words + local / 64] & (1u64 << (local % 64)) != 0
    }

    fn load_one(&mut self, block_id: usize, local: usize) {
        let word = block_id * self.words + local / 64;
        let bit = 1u64 << (local % 64);
        if self.kill[word] & bit == 0 {
            self.gen[word] |= bit;
        }
    }

    fn store_one(&mut self, block_id: usize, local: usize) {
        let word = block_id * self.words + local / 64;
        let bit = 1u64 << (local % 64);
        if self.gen[word] & bit == 0 {
            self.kill[word] |= bit;
        }
    }

    fn load_two(&mut self, block_id: usize, local: usize) {
        self.load_one(block_id, local);
        self.load_one(block_id, local + 1);
    }

    fn store_two(&mut self, block_id: usize, local: usize) {
        self.store_one(block_id, local);
        self.store_one(block_id, local + 1);
    }

    /// Scan one block's instructions for local reads and writes
    fn compute_local_effects(&mut self, method: &Method, map: &BlockMap, block: BlockId) {
        let data = map.block(block);
        if !matches!(data.kind, BlockKind::Normal) || data.start_bci < 0 || data.end_bci < 0 {
            return;
        }
        let block_id = data.id as usize;
        let mut stream = BytecodeStream::new(&method.code);
        stream.set_bci(data.start_bci);

        while stream.current_bci() <= data.end_bci && !stream.at_end() {
            match stream.current_bc() {
                LLOAD | DLOAD => self.load_two(block_id, stream.read_local_index()),
                LLOAD_0..=LLOAD_3 => self.load_two(block_id, (stream.current_bc() - LLOAD_0) as usize),
                DLOAD_0..=DLOAD_3 => self.load_two(block_id, (stream.current_bc() - DLOAD_0) as usize),
                IINC => {
                    let local = stream.read_local_index();
                    self.load_one(block_id, local);
                    self.store_one(block_id, local);
                }
                ILOAD | FLOAD | ALOAD | RET => self.load_one(block_id, stream.read_local_index()),
                ILOAD_0..=ILOAD_3 => self.load_one(block_id, (stream.current_bc() - ILOAD_0) as usize),
                FLOAD_0..=FLOAD_3 => self.load_one(block_id, (stream.current_bc() - FLOAD_0) as usize),
                ALOAD_0..=ALOAD_3 => self.load_one(block_id, (stream.current_bc() - ALOAD_0) as usize),
                LSTORE | DSTORE => self.store_two(block_id, stream.read_local_index()),
                LSTORE_0..=LSTORE_3 => self.store_two(block_id, (stream.current_bc() - LSTORE_0) as usize),
                DSTORE_0..=DSTORE_3 => self.store_two(block_id, (stream.current_bc() - DSTORE_0) as usize),
                ISTORE | FSTORE | ASTORE => self.store_one(block_id, stream.read_local_index()),
                ISTORE_0..=ISTORE_3 => self.store_one(block_id, (stream.current_bc() - ISTORE_0) as usize),
                FSTORE_0..=FSTORE_3 => self.store_one(block_id, (stream.current_bc() - FSTORE_0) as usize),
                ASTORE_0..=ASTORE_3 => self.store_one(block_id, (stream.current_bc() - ASTORE_0) as usize),
                _ => {}
            }
            stream.next();
        }
    }

    /// Backward fixpoint: live-out is the union of successors' live-in,
    /// live-in is gen plus live-out minus kill
    fn solve(&mut self, map: &BlockMap) {
        let words = self.words;
        let mut changed = true;
        let mut iteration = 0;
        while changed {
            log::trace!("liveness iteration {}", iteration);
            changed = false;
            for &block in map.order.iter().rev() {
                let data = map.block(block);
                let block_id = data.id as usize;

                let mut block_changed = iteration == 0;
                if !data.successors.is_empty() {
                    for word in 0..words {
                        let mut out = self.live_out[block_id * words + word];
                        let before = out;
                        for &successor in &data.successors {
                            let successor_id = map.block(successor).id;
                            if successor_id == UNNUMBERED {
                                continue;
                            }
                            out |= self.live_in[successor_id as usize * words + word];
                        }
                        if out != before {
                            self.live_out[block_id * words + word] = out;
                            block_changed = true;
                        }
                    }
                }

                if block_changed {
                    for word in 0..words {
                        let index = block_id * words + word;
                        self.live_in[index] =
                            (self.live_out[index] & !self.kill[index]) | self.gen[index];
                    }
                }
                changed |= block_changed;
            }
            iteration += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::{BlockMap, BuildConfig};
    use super::*;
    use crate::bytecode::opcodes::*;
    use crate::pool::{ConstantPool, Method, MethodAccessFlags, MethodData, MethodSig, PoolArenas, TypeData};
    use crate::Kind;

    fn build<'g>(
        pool: &'g ConstantPool<'g>,
        code: Vec<u8>,
        max_locals: usize,
    ) -> (Method<'g>, BlockMap) {
        let object = pool.add_type(TypeData::new("java/lang/Object", None));
        let holder = pool.add_type(TypeData::new("Test", Some(object)));
        let declaration = pool.add_method(MethodData::new(
            holder,
            "test",
            MethodSig::new(vec![], Kind::Void),
            MethodAccessFlags::STATIC,
        ));
        let method = Method::new(declaration, code, max_locals, 4);
        let map = BlockMap::build(&method, &BuildConfig::default()).unwrap();
        (method, map)
    }

    #[test]
    fn stored_before_load_is_dead_on_entry() {
        // 0: iconst_0, 1: istore_0, 2: iload_0, 3: ireturn
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let (method, map) = build(&pool, vec![ICONST_0, ISTORE_0, ILOAD_0, IRETURN], 1);
        let liveness = LocalLiveness::compute(&method, &map);

        let entry = map.block(map.start_block).id;
        assert!(!liveness.local_is_live_in(entry, 0));
    }

    #[test]
    fn loaded_across_branch_is_live_in_target() {
        // 0: iload_0, 1: ifeq 6, 4: iload_1, 5: ireturn, 6: iload_1, 7: ireturn
        let code = vec![
            ILOAD_0, IFEQ, 0x00, 0x05, ILOAD_1, IRETURN, ILOAD_1, IRETURN,
        ];
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let (method, map) = build(&pool, code, 2);
        let liveness = LocalLiveness::compute(&method, &map);

        let entry = map.block(map.start_block).id;
        assert!(liveness.local_is_live_in(entry, 0));
        assert!(liveness.local_is_live_in(entry, 1));

        // both branch targets read local 1 but not local 0
        for &block in &map.order {
            let data = map.block(block);
            if data.start_bci == 4 || data.start_bci == 6 {
                assert!(liveness.local_is_live_in(data.id, 1));
                assert!(!liveness.local_is_live_in(data.id, 0));
            }
        }
    }

    #[test]
    fn two_slot_store_kills_both_slots() {
        // 0: lconst_0, 1: lstore_0, 2: lload_0, 3: lreturn
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let (method, map) = build(&pool, vec![LCONST_0, LSTORE_0, LLOAD_0, LRETURN], 2);
        let liveness = LocalLiveness::compute(&method, &map);

        let entry = map.block(map.start_block).id;
        assert!(!liveness.local_is_live_in(entry, 0));
        assert!(!liveness.local_is_live_in(entry, 1));
    }
}
