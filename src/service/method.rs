//! Method identifiers.

use std::fmt;

/// The closed set of methods a worker answers.
///
/// The discriminant is the method byte on the wire; 0 is reserved.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodId {
    RunGraph = 1,
    RecvTensor = 2,
    GetStatus = 3,
    CreateWorkerSession = 4,
    DeleteWorkerSession = 5,
    RegisterGraph = 6,
    DeregisterGraph = 7,
    CleanupGraph = 8,
    CleanupAll = 9,
    Logging = 10,
    Tracing = 11,
    RecvBuf = 12,
    CompleteGroup = 13,
    CompleteInstance = 14,
    GetStepSequence = 15,
    FusedRecvTensor = 16,
}

impl MethodId {
    /// Number of methods.
    pub const COUNT: usize = 16;

    /// Every method, in wire order.
    pub const ALL: [MethodId; Self::COUNT] = [
        MethodId::RunGraph,
        MethodId::RecvTensor,
        MethodId::GetStatus,
        MethodId::CreateWorkerSession,
        MethodId::DeleteWorkerSession,
        MethodId::RegisterGraph,
        MethodId::DeregisterGraph,
        MethodId::CleanupGraph,
        MethodId::CleanupAll,
        MethodId::Logging,
        MethodId::Tracing,
        MethodId::RecvBuf,
        MethodId::CompleteGroup,
        MethodId::CompleteInstance,
        MethodId::GetStepSequence,
        MethodId::FusedRecvTensor,
    ];

    /// Method for a wire byte, `None` if unknown.
    pub fn from_u8(val: u8) -> Option<Self> {
        Self::ALL.get((val as usize).checked_sub(1)?).copied()
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Position in [`ALL`](Self::ALL).
    #[inline]
    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn name(self) -> &'static str {
        match self {
            MethodId::RunGraph => "RunGraph",
            MethodId::RecvTensor => "RecvTensor",
            MethodId::GetStatus => "GetStatus",
            MethodId::CreateWorkerSession => "CreateWorkerSession",
            MethodId::DeleteWorkerSession => "DeleteWorkerSession",
            MethodId::RegisterGraph => "RegisterGraph",
            MethodId::DeregisterGraph => "DeregisterGraph",
            MethodId::CleanupGraph => "CleanupGraph",
            MethodId::CleanupAll => "CleanupAll",
            MethodId::Logging => "Logging",
            MethodId::Tracing => "Tracing",
            MethodId::RecvBuf => "RecvBuf",
            MethodId::CompleteGroup => "CompleteGroup",
            MethodId::CompleteInstance => "CompleteInstance",
            MethodId::GetStepSequence => "GetStepSequence",
            MethodId::FusedRecvTensor => "FusedRecvTensor",
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
