use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use aero_cpu::CpuState;

use crate::exec::{BlockExecutor, BlockExit};
use crate::page::{align_up, host_page_size, PageMemory, Protection};
use crate::JitError;

/// Upper bound on simultaneously live pages per manager.
pub const MAX_PAGES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u32);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

/// Permission state of a page. A page is in exactly one of these at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Writable,
    Executable,
}

impl PageState {
    pub fn is_writable(self) -> bool {
        self == PageState::Writable
    }

    pub fn is_executable(self) -> bool {
        self == PageState::Executable
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitStats {
    pub live_pages: usize,
    pub bytes_mapped: usize,
    pub transitions: u64,
    pub executions: u64,
}

struct JitPage {
    memory: PageMemory,
    size: usize,
    /// Bytes of code written since the page was last made writable.
    len: usize,
    state: PageState,
}

impl JitPage {
    fn words(&self) -> Vec<u32> {
        self.memory.as_slice()[..self.len]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

#[derive(Default)]
struct PageTable {
    pages: HashMap<PageId, JitPage>,
    next_id: u32,
    stats: JitStats,
}

impl PageTable {
    fn page(&self, id: PageId) -> Result<&JitPage, JitError> {
        self.pages.get(&id).ok_or(JitError::UnknownPage(id))
    }

    fn page_mut(&mut self, id: PageId) -> Result<&mut JitPage, JitError> {
        self.pages.get_mut(&id).ok_or(JitError::UnknownPage(id))
    }

    fn transition(&mut self, id: PageId, to: PageState) -> Result<(), JitError> {
        let page = self.page_mut(id)?;
        if page.state == to {
            return Ok(());
        }
        let prot = match to {
            PageState::Writable => Protection::ReadWrite,
            PageState::Executable => Protection::ReadExec,
        };
        page.memory.protect(prot)?;
        page.state = to;
        if to == PageState::Writable {
            page.len = 0;
        }
        self.stats.transitions += 1;
        tracing::trace!(page = %id, state = ?to, "jit page transition");
        Ok(())
    }
}

/// Owner of all JIT pages, enforcing write-xor-execute.
///
/// Every operation takes the page-table lock, so a manager can be shared between engines through
/// an `Arc` and no caller ever observes a page mid-transition.
pub struct JitMemoryManager {
    table: Mutex<PageTable>,
}

impl Default for JitMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JitMemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitMemoryManager")
            .field("stats", &self.stats())
            .finish()
    }
}

impl JitMemoryManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(PageTable::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PageTable> {
        // A panic while holding the lock cannot leave a page half-transitioned: the state field
        // is only updated after `mprotect` succeeded.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a zeroed, writable page of at least `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<PageId, JitError> {
        let mut table = self.lock();
        if table.pages.len() >= MAX_PAGES {
            return Err(JitError::TooManyPages { max: MAX_PAGES });
        }
        let size = align_up(size.max(1), host_page_size());
        let memory = PageMemory::map(size)?;
        let id = PageId(table.next_id);
        table.next_id = table.next_id.wrapping_add(1);
        table.pages.insert(
            id,
            JitPage {
                memory,
                size,
                len: 0,
                state: PageState::Writable,
            },
        );
        table.stats.live_pages += 1;
        table.stats.bytes_mapped += size;
        tracing::debug!(page = %id, size, "jit page allocated");
        Ok(id)
    }

    pub fn make_writable(&self, id: PageId) -> Result<(), JitError> {
        self.lock().transition(id, PageState::Writable)
    }

    pub fn make_executable(&self, id: PageId) -> Result<(), JitError> {
        self.lock().transition(id, PageState::Executable)
    }

    /// Copy `code` to the start of a writable page.
    pub fn write(&self, id: PageId, code: &[u8]) -> Result<(), JitError> {
        let mut table = self.lock();
        let page = table.page_mut(id)?;
        if page.state != PageState::Writable {
            return Err(JitError::WriteToExecutable(id));
        }
        if code.len() > page.size {
            return Err(JitError::CodeTooLarge {
                len: code.len(),
                size: page.size,
            });
        }
        page.memory.as_mut_slice()[..code.len()].copy_from_slice(code);
        page.len = code.len();
        Ok(())
    }

    /// Little-endian convenience wrapper around [`Self::write`].
    pub fn write_words(&self, id: PageId, words: &[u32]) -> Result<(), JitError> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.write(id, &bytes)
    }

    pub fn state(&self, id: PageId) -> Result<PageState, JitError> {
        Ok(self.lock().page(id)?.state)
    }

    /// Bytes of code currently held by the page.
    pub fn code_len(&self, id: PageId) -> Result<usize, JitError> {
        Ok(self.lock().page(id)?.len)
    }

    pub fn stats(&self) -> JitStats {
        self.lock().stats
    }

    pub fn free(&self, id: PageId) -> Result<(), JitError> {
        let mut table = self.lock();
        let page = table.pages.remove(&id).ok_or(JitError::UnknownPage(id))?;
        table.stats.live_pages -= 1;
        table.stats.bytes_mapped -= page.size;
        tracing::debug!(page = %id, "jit page freed");
        Ok(())
    }

    /// Call the page as `int fn(int argc, char **argv)`.
    ///
    /// On AArch64 hosts this transfers control to the page natively. Elsewhere the words are run
    /// by the portable executor with `x0 = argc`, `x1 = argv` and no data memory, and the result
    /// is `w0` at `RET`.
    pub fn execute(&self, id: PageId, argc: i32, argv: &[*const u8]) -> Result<i32, JitError> {
        let mut table = self.lock();
        let page = table.page(id)?;
        if page.state != PageState::Executable {
            return Err(JitError::ExecuteWritable(id));
        }
        if page.len == 0 {
            return Err(JitError::AbnormalExit {
                page: id,
                reason: "page holds no code".into(),
            });
        }

        #[cfg(all(unix, target_arch = "aarch64"))]
        let code = {
            let entry = page.memory.entry();
            // SAFETY: the page is mapped read+execute, holds `len` bytes of code written through
            // `write`, and the instruction cache was flushed on the transition. The caller
            // vouches that the code follows the C calling convention and ends in `RET`.
            unsafe {
                let func: unsafe extern "C" fn(i32, *const *const u8) -> i32 =
                    std::mem::transmute(entry);
                func(argc, argv.as_ptr())
            }
        };

        #[cfg(not(all(unix, target_arch = "aarch64")))]
        let code = interpret_call(id, &page.words(), argc, argv)?;

        table.stats.executions += 1;
        Ok(code)
    }

    /// Run the page's code against guest state through `executor`.
    pub fn run_block(
        &self,
        id: PageId,
        cpu: &mut CpuState,
        executor: &mut dyn BlockExecutor,
    ) -> Result<BlockExit, JitError> {
        let mut table = self.lock();
        let page = table.page(id)?;
        if page.state != PageState::Executable {
            return Err(JitError::ExecuteWritable(id));
        }
        let words = page.words();
        let exit = executor.run_block(&words, cpu)?;
        table.stats.executions += 1;
        Ok(exit)
    }
}

#[cfg(not(all(unix, target_arch = "aarch64")))]
fn interpret_call(
    id: PageId,
    words: &[u32],
    argc: i32,
    argv: &[*const u8],
) -> Result<i32, JitError> {
    use crate::exec::{A64Interpreter, A64State, NoMemory};

    let mut state = A64State::default();
    state.x[0] = argc as u32 as u64;
    state.x[1] = argv.as_ptr() as u64;
    match A64Interpreter::new().run(words, &mut state, &mut NoMemory) {
        Ok(BlockExit::Return) => Ok(state.x[0] as u32 as i32),
        Ok(exit) => Err(JitError::AbnormalExit {
            page: id,
            reason: format!("{exit:?}"),
        }),
        Err(err) => Err(JitError::AbnormalExit {
            page: id,
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOV_W0_42: u32 = 0x5280_0540;
    const RET: u32 = 0xD65F_03C0;

    #[test]
    fn allocate_is_writable_and_page_aligned() {
        let jit = JitMemoryManager::new();
        let id = jit.allocate(10).unwrap();
        assert_eq!(jit.state(id).unwrap(), PageState::Writable);
        let stats = jit.stats();
        assert_eq!(stats.live_pages, 1);
        assert_eq!(stats.bytes_mapped % host_page_size(), 0);
        jit.free(id).unwrap();
        assert_eq!(jit.stats().live_pages, 0);
    }

    #[test]
    fn write_rejected_while_executable() {
        let jit = JitMemoryManager::new();
        let id = jit.allocate(4096).unwrap();
        jit.write_words(id, &[RET]).unwrap();
        jit.make_executable(id).unwrap();
        assert!(matches!(
            jit.write_words(id, &[RET]),
            Err(JitError::WriteToExecutable(p)) if p == id
        ));
    }

    #[test]
    fn execute_rejected_while_writable() {
        let jit = JitMemoryManager::new();
        let id = jit.allocate(4096).unwrap();
        jit.write_words(id, &[MOV_W0_42, RET]).unwrap();
        assert!(matches!(
            jit.execute(id, 0, &[]),
            Err(JitError::ExecuteWritable(_))
        ));
    }

    #[test]
    fn execute_returns_w0() {
        let jit = JitMemoryManager::new();
        let id = jit.allocate(4096).unwrap();
        jit.write_words(id, &[MOV_W0_42, RET]).unwrap();
        jit.make_executable(id).unwrap();
        assert_eq!(jit.execute(id, 0, &[]).unwrap(), 42);
        assert_eq!(jit.stats().executions, 1);
    }

    #[test]
    fn reopen_and_rewrite() {
        let jit = JitMemoryManager::new();
        let id = jit.allocate(4096).unwrap();
        jit.write_words(id, &[MOV_W0_42, RET]).unwrap();
        jit.make_executable(id).unwrap();
        jit.make_writable(id).unwrap();
        assert_eq!(jit.code_len(id).unwrap(), 0);
        // mov w0, #44
        jit.write_words(id, &[0x5280_0580, RET]).unwrap();
        jit.make_executable(id).unwrap();
        assert_eq!(jit.execute(id, 0, &[]).unwrap(), 44);
        assert_eq!(jit.stats().transitions, 3);
    }

    #[test]
    fn oversized_code_is_rejected() {
        let jit = JitMemoryManager::new();
        let id = jit.allocate(1).unwrap();
        let size = host_page_size();
        let err = jit.write(id, &vec![0; size + 4]).unwrap_err();
        assert!(matches!(err, JitError::CodeTooLarge { .. }));
    }

    #[test]
    fn freed_pages_are_unknown() {
        let jit = JitMemoryManager::new();
        let id = jit.allocate(4096).unwrap();
        jit.free(id).unwrap();
        assert!(matches!(jit.state(id), Err(JitError::UnknownPage(_))));
        assert!(matches!(jit.free(id), Err(JitError::UnknownPage(_))));
    }
}
