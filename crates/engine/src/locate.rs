use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

const PROGRAM: &str = "conda";

const COMMON_LOCATIONS: &[&str] = &[
    "/opt/homebrew/anaconda3/bin/conda",
    "/opt/homebrew/Caskroom/miniconda/base/bin/conda",
    "/usr/local/anaconda3/bin/conda",
    "/usr/local/bin/conda",
    "/opt/conda/bin/conda",
];

const HOME_LOCATIONS: &[&str] = &[
    "anaconda3/bin/conda",
    "miniconda3/bin/conda",
    "miniforge3/bin/conda",
];

/// Inputs for finding the package-manager executable, in priority order.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub explicit: Option<PathBuf>,
    pub conda_exe: Option<OsString>,
    pub search_path: Option<OsString>,
    pub home: Option<PathBuf>,
}

impl Discovery {
    pub fn from_env(explicit: Option<PathBuf>) -> Self {
        Self {
            explicit,
            conda_exe: env::var_os("CONDA_EXE"),
            search_path: env::var_os("PATH"),
            home: env::var_os("HOME").map(PathBuf::from),
        }
    }

    /// Returns the first usable executable, or `None` when nothing is installed.
    /// An explicit path is returned even if it does not exist yet so that the
    /// failure surfaces per request.
    pub fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            return Some(path.clone());
        }
        if let Some(exe) = self.conda_exe.as_ref().filter(|exe| !exe.is_empty()) {
            let path = PathBuf::from(exe);
            if is_executable(&path) {
                return Some(path);
            }
        }
        if let Some(found) = self
            .search_path
            .as_ref()
            .and_then(|search| find_in_path(PROGRAM, search))
        {
            return Some(condabin_to_bin(found));
        }
        let home_candidates = self
            .home
            .iter()
            .flat_map(|home| HOME_LOCATIONS.iter().map(move |rel| home.join(rel)));
        COMMON_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .chain(home_candidates)
            .find(|path| is_executable(path))
    }
}

/// `condabin/conda` is a shell shim; the real entry point lives in `bin/`.
fn condabin_to_bin(path: PathBuf) -> PathBuf {
    let is_condabin = path
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|name| name == "condabin");
    if !is_condabin {
        return path;
    }
    let candidate = path
        .parent()
        .and_then(Path::parent)
        .map(|root| root.join("bin").join(PROGRAM));
    match candidate {
        Some(bin) if is_executable(&bin) => bin,
        _ => path,
    }
}

/// Resolves `program` to something that can be spawned right now.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return is_executable(program).then(|| program.to_path_buf());
    }
    let name = program.to_str()?;
    let search = env::var_os("PATH")?;
    find_in_path(name, &search)
}

fn find_in_path(name: &str, search: &OsString) -> Option<PathBuf> {
    env::split_paths(search)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{temp_dir, write_script};

    #[test]
    fn explicit_path_wins() {
        let discovery = Discovery {
            explicit: Some(PathBuf::from("/custom/conda")),
            conda_exe: Some(OsString::from("/bin/sh")),
            ..Discovery::default()
        };
        assert_eq!(discovery.locate(), Some(PathBuf::from("/custom/conda")));
    }

    #[test]
    fn conda_exe_then_path() {
        let root = temp_dir("locate-exe");
        let exe = write_script(&root.join("exe"), "conda", "exit 0");
        let on_path = write_script(&root.join("path"), "conda", "exit 0");

        let discovery = Discovery {
            conda_exe: Some(exe.clone().into_os_string()),
            search_path: Some(root.join("path").into_os_string()),
            ..Discovery::default()
        };
        assert_eq!(discovery.locate(), Some(exe));

        let discovery = Discovery {
            conda_exe: Some(OsString::from("/missing/conda")),
            search_path: Some(root.join("path").into_os_string()),
            ..Discovery::default()
        };
        assert_eq!(discovery.locate(), Some(on_path));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn condabin_hit_maps_to_bin() {
        let root = temp_dir("locate-condabin");
        write_script(&root.join("condabin"), "conda", "exit 0");
        let bin = write_script(&root.join("bin"), "conda", "exit 0");
        let discovery = Discovery {
            search_path: Some(root.join("condabin").into_os_string()),
            ..Discovery::default()
        };
        assert_eq!(discovery.locate(), Some(bin));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn home_locations_are_searched() {
        let root = temp_dir("locate-home");
        let conda = write_script(&root.join("miniforge3/bin"), "conda", "exit 0");
        let discovery = Discovery {
            home: Some(root.clone()),
            search_path: Some(OsString::new()),
            ..Discovery::default()
        };
        // A system-wide install would take precedence; only assert when none exists.
        if COMMON_LOCATIONS.iter().all(|p| !Path::new(p).exists()) {
            assert_eq!(discovery.locate(), Some(conda));
        }
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn resolve_program_checks_explicit_paths() {
        assert!(resolve_program(Path::new("/definitely/not/conda")).is_none());
        assert_eq!(
            resolve_program(Path::new("/bin/sh")),
            Some(PathBuf::from("/bin/sh"))
        );
        assert!(resolve_program(Path::new("sh")).is_some());
    }
}
