mod privilege_wrapper;

pub use privilege_wrapper::{PrivilegeWrapper, SYSTEMCTL_BIN};
