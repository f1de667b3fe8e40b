// Host register ownership for the block being lowered. Translated code only computes with
// general purpose registers, so the file tracks a single bank of sixteen: a mask of the
// registers the calling convention hands out, a mask of the ones currently owned by an IR
// local, and a per-register lock count that pins operands of the instruction being emitted.
// When every allocatable register is owned the next victim is chosen round-robin, skipping
// pinned registers. The file never emits code itself; allocate() returns the displaced owner
// and the code generator decides whether its value has to be written back to the stack.

//! Round-robin host register allocation state.

use thiserror::Error;

/// Number of x86-64 general purpose registers.
pub const GP_REGISTERS: usize = 16;

/// Index of an IR local within the function being lowered.
pub type LocalIdx = u32;

/// Host register reference. Bank 0 is the general purpose bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: u8,
    pub id: u8,
}

impl AsmReg {
    pub const fn new(bank: u8, id: u8) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: u8) -> Self {
        Self { bank: 0, id }
    }

    fn bit(self) -> u16 {
        if self.bank == 0 && (self.id as usize) < GP_REGISTERS {
            1 << self.id
        } else {
            0
        }
    }
}

/// Set of general purpose registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegSet(u16);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    pub fn from_regs(regs: &[AsmReg]) -> Self {
        RegSet(regs.iter().fold(0, |mask, reg| mask | reg.bit()))
    }

    pub fn contains(self, reg: AsmReg) -> bool {
        let bit = reg.bit();
        bit != 0 && self.0 & bit != 0
    }

    pub fn insert(&mut self, reg: AsmReg) {
        self.0 |= reg.bit();
    }

    pub fn remove(&mut self, reg: AsmReg) {
        self.0 &= !reg.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(self) -> impl Iterator<Item = AsmReg> {
        (0..GP_REGISTERS as u8)
            .map(AsmReg::gp)
            .filter(move |reg| self.contains(*reg))
    }
}

impl std::ops::BitAnd for RegSet {
    type Output = RegSet;

    fn bitand(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 & rhs.0)
    }
}

impl std::ops::Sub for RegSet {
    type Output = RegSet;

    fn sub(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 & !rhs.0)
    }
}

/// Owner of an allocated register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub local: LocalIdx,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegAllocError {
    #[error("every allocatable register is locked")]
    Exhausted,

    #[error("{0:?} is not an allocatable register")]
    NotAllocatable(AsmReg),

    #[error("{0:?} has no owner")]
    Unowned(AsmReg),

    #[error("{0:?} unlocked more often than locked")]
    UnbalancedUnlock(AsmReg),
}

/// Register ownership for a single translated block.
pub struct RegisterFile {
    allocatable: RegSet,
    owned: RegSet,
    owners: [Option<LocalIdx>; GP_REGISTERS],
    locks: [u8; GP_REGISTERS],
    /// Next register the eviction scan looks at.
    hand: u8,
}

impl RegisterFile {
    pub fn new(allocatable: RegSet) -> Self {
        Self {
            allocatable,
            owned: RegSet::EMPTY,
            owners: [None; GP_REGISTERS],
            locks: [0; GP_REGISTERS],
            hand: 0,
        }
    }

    /// Give `local` a register, returning the previous owner when one had to be evicted.
    ///
    /// Free registers are handed out in the order of the allocatable set's lowest bit first.
    /// Eviction never picks a locked register.
    pub fn allocate(
        &mut self,
        local: LocalIdx,
    ) -> Result<(AsmReg, Option<Assignment>), RegAllocError> {
        if let Some(reg) = (self.allocatable - self.owned).iter().next() {
            self.claim(reg, local);
            return Ok((reg, None));
        }

        let victim = self.next_victim().ok_or(RegAllocError::Exhausted)?;
        let previous = self.owners[victim.id as usize].map(|local| Assignment { local });
        self.claim(victim, local);
        Ok((victim, previous))
    }

    fn next_victim(&mut self) -> Option<AsmReg> {
        for _ in 0..GP_REGISTERS {
            let reg = AsmReg::gp(self.hand);
            self.hand = (self.hand + 1) % GP_REGISTERS as u8;
            if self.owned.contains(reg) && self.locks[reg.id as usize] == 0 {
                return Some(reg);
            }
        }
        None
    }

    fn claim(&mut self, reg: AsmReg, local: LocalIdx) {
        self.owned.insert(reg);
        self.owners[reg.id as usize] = Some(local);
        self.locks[reg.id as usize] = 0;
    }

    /// Drop ownership of `reg` without storing it anywhere.
    pub fn release(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        if !self.allocatable.contains(reg) {
            return Err(RegAllocError::NotAllocatable(reg));
        }
        if !self.owned.contains(reg) {
            return Err(RegAllocError::Unowned(reg));
        }
        self.owned.remove(reg);
        self.owners[reg.id as usize] = None;
        self.locks[reg.id as usize] = 0;
        Ok(())
    }

    /// Pin an owned register until the matching unlock.
    pub fn lock(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        if !self.owned.contains(reg) {
            return Err(RegAllocError::Unowned(reg));
        }
        let count = &mut self.locks[reg.id as usize];
        *count = count.saturating_add(1);
        Ok(())
    }

    pub fn unlock(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        if !self.owned.contains(reg) {
            return Err(RegAllocError::Unowned(reg));
        }
        let count = &mut self.locks[reg.id as usize];
        *count = count
            .checked_sub(1)
            .ok_or(RegAllocError::UnbalancedUnlock(reg))?;
        Ok(())
    }

    pub fn unlock_all(&mut self) {
        self.locks = [0; GP_REGISTERS];
    }

    pub fn is_locked(&self, reg: AsmReg) -> bool {
        self.owned.contains(reg) && self.locks[reg.id as usize] != 0
    }

    pub fn owner(&self, reg: AsmReg) -> Option<Assignment> {
        if !self.owned.contains(reg) {
            return None;
        }
        self.owners[reg.id as usize].map(|local| Assignment { local })
    }

    /// Register currently holding `local`.
    pub fn holder_of(&self, local: LocalIdx) -> Option<AsmReg> {
        self.owned
            .iter()
            .find(|reg| self.owners[reg.id as usize] == Some(local))
    }

    /// Owned registers within `set`, with their owners.
    pub fn owned_in(&self, set: RegSet) -> Vec<(AsmReg, Assignment)> {
        (self.owned & set)
            .iter()
            .filter_map(|reg| self.owner(reg).map(|owner| (reg, owner)))
            .collect()
    }

    /// Number of registers currently owned.
    pub fn occupancy(&self) -> u32 {
        self.owned.len()
    }

    /// Forget every assignment. Called at block boundaries.
    pub fn reset(&mut self) {
        self.owned = RegSet::EMPTY;
        self.owners = [None; GP_REGISTERS];
        self.locks = [0; GP_REGISTERS];
        self.hand = 0;
    }
}
