use std::num::NonZeroUsize;

use log::debug;
use nix::libc::c_void;
use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};

use crate::{
    compiled_block::LocationRange,
    memory::{TargetAddress, VirtualAddress},
    x86_asm::{Branch, DisplacementWidth, OpCode},
};

#[derive(Debug)]
pub enum Error {
    /// There is no code to map
    EmptyBlock,
    /// The host refused to map or protect the pages
    Mapping(nix::Error),
}

impl From<nix::Error> for Error {
    fn from(error: nix::Error) -> Self {
        Self::Mapping(error)
    }
}

/// Location of an emitted instruction inside the stream
#[derive(Clone, Copy, Debug)]
pub struct Marker {
    offset: usize,
    size: usize,
}

impl Marker {
    /// Offset right after the instruction
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// A branch target inside the stream. It can be referenced before it is bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

/// A branch displacement waiting for its label to be bound
#[derive(Debug)]
struct Patch {
    offset: usize,
    width: DisplacementWidth,
    label: Label,
}

pub struct OpCodeStream {
    data: Vec<u8>,
    labels: Vec<Option<usize>>,
    patches: Vec<Patch>,
}

impl OpCodeStream {
    pub fn new() -> Self {
        Self {
            data: vec![],
            labels: vec![],
            patches: vec![],
        }
    }

    pub fn push_opcode(&mut self, opcode: OpCode) -> Marker {
        let offset = self.data.len();
        self.data.extend_from_slice(opcode.bytes());
        Marker {
            offset,
            size: opcode.len(),
        }
    }

    /// Current write cursor
    pub fn position(&self) -> usize {
        self.data.len()
    }

    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds the label to the current position and resolves every patch waiting for it.
    pub fn bind_label(&mut self, label: Label) {
        assert!(
            self.labels[label.0].is_none(),
            "Label {:?} bound twice",
            label
        );
        self.labels[label.0] = Some(self.position());

        let (ready, pending): (Vec<Patch>, Vec<Patch>) = std::mem::take(&mut self.patches)
            .into_iter()
            .partition(|patch| patch.label == label);
        self.patches = pending;
        for patch in ready {
            self.resolve(&patch);
        }
    }

    /// Emits the branch targeting the given label. Backward branches are resolved right away,
    /// forward ones are recorded as patches.
    pub fn push_branch(&mut self, branch: Branch, label: Label) -> Marker {
        let width = branch.displacement_width();
        let marker = self.push_opcode(branch.with_displacement(0).generate());
        let patch = Patch {
            offset: marker.end() - width.bytes(),
            width,
            label,
        };
        if self.labels[label.0].is_some() {
            self.resolve(&patch);
        } else {
            self.patches.push(patch);
        }
        marker
    }

    fn relative_distance(&self, from: usize, to: usize) -> i64 {
        to as i64 - from as i64
    }

    fn resolve(&mut self, patch: &Patch) {
        let target = self.labels[patch.label.0].expect("Resolving a patch for an unbound label");
        let distance = self.relative_distance(patch.offset + patch.width.bytes(), target);
        match patch.width {
            DisplacementWidth::Rel8 => {
                let displacement = i8::try_from(distance).unwrap_or_else(|_| {
                    panic!(
                        "Displacement {} at offset {} does not fit a short branch",
                        distance, patch.offset
                    )
                });
                self.data[patch.offset] = displacement as u8;
            }
            DisplacementWidth::Rel32 => {
                let displacement =
                    i32::try_from(distance).expect("Displacement does not fit a near branch");
                self.data[patch.offset..patch.offset + 4]
                    .copy_from_slice(&displacement.to_le_bytes());
            }
        }
    }

    /// Returns the encoded bytes. Every patch must be resolved by now.
    pub fn finalize(self) -> Vec<u8> {
        assert!(
            self.patches.is_empty(),
            "Unresolved branch patches at finalize: {:?}",
            self.patches
        );
        self.data
    }
}

/// A translation unit under construction: the guest range being translated and the host code
/// emitted for it so far.
pub struct CodeBlock {
    start_address: TargetAddress,
    guest_size: Option<usize>,
    stream: OpCodeStream,
}

impl CodeBlock {
    pub fn open(start_address: TargetAddress) -> Self {
        Self {
            start_address,
            guest_size: None,
            stream: OpCodeStream::new(),
        }
    }

    pub fn start_address(&self) -> TargetAddress {
        self.start_address
    }

    pub fn stream(&mut self) -> &mut OpCodeStream {
        &mut self.stream
    }

    /// Records how many guest bytes the block covers. No more code is expected after this.
    pub fn close(&mut self, guest_size: usize) {
        self.guest_size = Some(guest_size);
    }

    /// Resolves the block into its guest range and final host code.
    pub fn finalize(self) -> (LocationRange, Vec<u8>) {
        let guest_size = self
            .guest_size
            .expect("Finalizing a code block that was never closed");
        let range = LocationRange::new(self.start_address, guest_size);
        (range, self.stream.finalize())
    }
}

/// Host code mapped read + execute.
pub struct ExecutableBlock {
    ptr: *mut c_void,
    len: NonZeroUsize,
}

impl ExecutableBlock {
    /// Copies the code into a fresh anonymous mapping and then flips it to READ_EXECUTE.
    pub fn new(code: &[u8]) -> Result<Self, Error> {
        let len = NonZeroUsize::new(code.len()).ok_or(Error::EmptyBlock)?;
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
            if let Err(error) = mprotect(ptr, len.get(), ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)
            {
                let _ = munmap(ptr, len.get());
                return Err(error.into());
            }
        }

        debug!("Mapped {} bytes of host code at {:p}", code.len(), ptr);
        Ok(Self { ptr, len })
    }

    pub fn entrypoint(&self) -> VirtualAddress {
        self.ptr as VirtualAddress
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }
}

impl Drop for ExecutableBlock {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len.get());
        }
    }
}
