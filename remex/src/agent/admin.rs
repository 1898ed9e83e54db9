/// The closed set of administrative operations an agent serves inline.
///
/// Admin calls never fork: they read or mutate the agent's own state
/// (process table, function store, root directory) in the serve process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOp {
    /// greet the caller with its own address
    Hello,
    /// logical CPU count of the agent host
    CpuCount,
    /// every registered identifier, admin set included
    List,
    /// SIGSTOP the child running the given invocation
    Suspend,
    /// SIGCONT the child running the given invocation
    Resume,
    /// signature of a subtree under the agent root
    DirSignature,
    /// apply a delta to a subtree under the agent root
    DirPatch,
    /// drop cached modules so patched code becomes visible
    CleanCache,
}

impl AdminOp {
    pub const ALL: [AdminOp; 8] = [
        AdminOp::Hello,
        AdminOp::CpuCount,
        AdminOp::List,
        AdminOp::Suspend,
        AdminOp::Resume,
        AdminOp::DirSignature,
        AdminOp::DirPatch,
        AdminOp::CleanCache,
    ];

    pub fn identifier(self) -> &'static str {
        match self {
            AdminOp::Hello => "_adm_hello",
            AdminOp::CpuCount => "_adm_cpu_count",
            AdminOp::List => "_adm_list",
            AdminOp::Suspend => "_adm_suspend",
            AdminOp::Resume => "_adm_resume",
            AdminOp::DirSignature => "_adm_dir_signature",
            AdminOp::DirPatch => "_adm_dir_patch",
            AdminOp::CleanCache => "_adm_clean_cache",
        }
    }

    pub fn parse(identifier: &str) -> Option<AdminOp> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.identifier() == identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ADMIN_PREFIX;

    #[test]
    fn identifier_roundtrip() {
        for op in AdminOp::ALL {
            assert_eq!(AdminOp::parse(op.identifier()), Some(op));
            assert!(op.identifier().starts_with(ADMIN_PREFIX));
        }
        assert_eq!(AdminOp::parse("_adm_nope"), None);
        assert_eq!(AdminOp::parse("tasks:sqr"), None);
    }
}
