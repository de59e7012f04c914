//! Kernel-wide error types.
//!
//! Subsystems return `Result<T, KernelError>` and propagate with `?`;
//! the syscall boundary is the single place errors become numeric via
//! [`Errno`]. The kernel never unwinds: fatal conditions route through
//! `panic!`, everything else is a value.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory management errors
    Mm(MmError),
    /// IPC channel and pipe errors
    Ipc(IpcError),
    /// Scheduler errors
    Sched(SchedError),
    /// Namespace and file operation errors
    Fs(FsError),
    /// A user-supplied pointer was outside the user half or unmapped
    BadUserPointer { addr: u64 },
    /// Invalid file descriptor
    BadFd { fd: usize },
    /// Malformed syscall arguments
    InvalidArgument,
    /// Process table slot or pid not found
    ProcessNotFound { pid: u64 },
    /// Resource quota exceeded
    QuotaExceeded { resource: &'static str },
    /// Syscall number not implemented
    NotSupported,
}

/// Memory management errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// No free frames (or no contiguous run of the requested length)
    OutOfFrames,
    /// Heap arena could not be extended contiguously
    HeapExhausted,
    /// Virtual address already mapped
    AlreadyMapped { vaddr: u64 },
    /// Virtual address not mapped
    NotMapped { vaddr: u64 },
    /// Malformed ELF image
    BadElf,
}

/// IPC errors, shared by channels and pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Channel table full
    NoFreeChannels,
    /// Pipe table full
    NoFreePipes,
    /// Channel id out of range or endpoint not owned by caller
    BadChannel { id: usize },
    /// Message payload exceeds the inline buffer
    MessageTooLarge { len: usize },
    /// Server replied `r_error`
    PeerError,
    /// Endpoint has no blocked peer to reply to
    NoPeer,
}

/// Scheduler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Run queue full
    QueueFull { core: usize },
    /// No process slot free
    NoFreeSlots,
}

/// Namespace and file errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No mount matches the path
    NotFound,
    /// Mount table full
    MountTableFull,
    /// No mount at exactly this path (unmount)
    NotMounted,
    /// fd table full
    TooManyOpenFiles,
    /// Device or server I/O failure
    Io,
}

/// Result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Negative error codes returned to userspace as wide unsigned values.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    Enoent = -2,
    Eio = -5,
    Ebadf = -9,
    Enomem = -12,
    Efault = -14,
    Einval = -22,
    Emfile = -24,
    Enosys = -38,
}

impl Errno {
    /// Encode as the u64 actually placed in the syscall return register.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self as i64 as u64
    }
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Mm(MmError::OutOfFrames) | KernelError::Mm(MmError::HeapExhausted) => {
                Errno::Enomem
            }
            KernelError::Mm(MmError::BadElf) => Errno::Einval,
            KernelError::Mm(_) => Errno::Efault,
            KernelError::Ipc(IpcError::NoFreeChannels)
            | KernelError::Ipc(IpcError::NoFreePipes) => Errno::Enomem,
            KernelError::Ipc(IpcError::MessageTooLarge { .. }) => Errno::Einval,
            KernelError::Ipc(IpcError::PeerError) => Errno::Eio,
            KernelError::Ipc(_) => Errno::Ebadf,
            KernelError::Sched(_) => Errno::Enomem,
            KernelError::Fs(FsError::NotFound) | KernelError::Fs(FsError::NotMounted) => {
                Errno::Enoent
            }
            KernelError::Fs(FsError::TooManyOpenFiles) => Errno::Emfile,
            KernelError::Fs(FsError::MountTableFull) => Errno::Enomem,
            KernelError::Fs(FsError::Io) => Errno::Eio,
            KernelError::BadUserPointer { .. } => Errno::Efault,
            KernelError::BadFd { .. } => Errno::Ebadf,
            KernelError::InvalidArgument => Errno::Einval,
            KernelError::ProcessNotFound { .. } => Errno::Einval,
            KernelError::QuotaExceeded { .. } => Errno::Enomem,
            KernelError::NotSupported => Errno::Enosys,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mm(e) => write!(f, "mm: {:?}", e),
            Self::Ipc(e) => write!(f, "ipc: {:?}", e),
            Self::Sched(e) => write!(f, "sched: {:?}", e),
            Self::Fs(e) => write!(f, "fs: {:?}", e),
            Self::BadUserPointer { addr } => write!(f, "bad user pointer {:#x}", addr),
            Self::BadFd { fd } => write!(f, "bad fd {}", fd),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::QuotaExceeded { resource } => write!(f, "quota exceeded: {}", resource),
            Self::NotSupported => write!(f, "not supported"),
        }
    }
}

impl From<MmError> for KernelError {
    fn from(err: MmError) -> Self {
        Self::Mm(err)
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        Self::Ipc(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn errno_encoding_is_sign_extended() {
        assert_eq!(Errno::Enoent.as_u64(), (-2i64) as u64);
        assert_eq!(Errno::Enosys.as_u64(), (-38i64) as u64);
    }

    #[test]
    fn error_to_errno_mapping() {
        assert_eq!(
            Errno::from(KernelError::Fs(FsError::NotFound)),
            Errno::Enoent
        );
        assert_eq!(Errno::from(KernelError::BadFd { fd: 7 }), Errno::Ebadf);
        assert_eq!(
            Errno::from(KernelError::Mm(MmError::OutOfFrames)),
            Errno::Enomem
        );
        assert_eq!(
            Errno::from(KernelError::Fs(FsError::TooManyOpenFiles)),
            Errno::Emfile
        );
    }
}
