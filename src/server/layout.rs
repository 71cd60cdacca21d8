//! Files and directories owned by the internal server.

use std::path::{Path, PathBuf};

use crate::db::{ConnectionParameters, SOCKET_FILE_NAME};

pub const GLOBAL_TEMPLATE: &str = "mysql-global.conf";
pub const LOCAL_TEMPLATE: &str = "mysql-local.conf";

/// On-disk layout of one internal server instance.
///
/// `base_dir` is the server-private directory; the data directory lives
/// there too unless the parameters name another location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLayout {
    pub base_dir: PathBuf,
    pub data_dir: PathBuf,
    pub misc_dir: PathBuf,
    pub file_data_dir: PathBuf,
    pub actual_config: PathBuf,
    pub global_config: Option<PathBuf>,
    pub local_config: Option<PathBuf>,
}

impl ServerLayout {
    pub fn new(params: &ConnectionParameters, base_dir: &Path) -> Self {
        let data_dir = if params.internal_server_path.is_empty() {
            tracing::debug!("No internal server data path is given, using the default");
            base_dir.join("db_data")
        } else {
            params
                .internal_server_data_path()
                .join(".mysql.clepho")
                .join("db_data")
        };

        tracing::debug!("Internal server data path: {}", data_dir.display());

        Self {
            base_dir: base_dir.to_path_buf(),
            data_dir,
            misc_dir: base_dir.join("db_misc"),
            file_data_dir: base_dir.join("file_db_data"),
            actual_config: base_dir.join("mysql.conf"),
            global_config: locate_template(GLOBAL_TEMPLATE),
            local_config: locate_template(LOCAL_TEMPLATE),
        }
    }

    /// Use explicit template files instead of the installed ones.
    pub fn with_templates(mut self, global: Option<PathBuf>, local: Option<PathBuf>) -> Self {
        self.global_config = global;
        self.local_config = local;
        self
    }

    pub fn socket_path(&self) -> PathBuf {
        self.misc_dir.join(SOCKET_FILE_NAME)
    }

    pub fn error_log(&self) -> PathBuf {
        self.data_dir.join("mysql.err")
    }

    pub fn old_error_log(&self) -> PathBuf {
        self.data_dir.join("mysql.err.old")
    }

    /// Present once the data directory has been initialized.
    pub fn init_marker(&self) -> PathBuf {
        self.data_dir.join("mysql")
    }
}

fn template_dirs() -> Vec<PathBuf> {
    let mut dirs_list = Vec::new();

    if let Some(data) = dirs::data_dir() {
        dirs_list.push(data);
    }

    let system = std::env::var("XDG_DATA_DIRS")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "/usr/local/share:/usr/share".to_string());

    dirs_list.extend(std::env::split_paths(&system));
    dirs_list
}

/// First installed copy of a template under `clepho/database/`.
pub fn locate_template(name: &str) -> Option<PathBuf> {
    template_dirs()
        .into_iter()
        .map(|dir| dir.join("clepho").join("database").join(name))
        .find(|path| path.is_file())
}
