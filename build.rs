//! Build script for shan
//!
//! With the `mpi` feature this script:
//! 1. Finds the MPI installation via pkg-config or mpicc
//! 2. Compiles the C wrapper (shan_mpi.c)
//! 3. Links against the MPI library
//!
//! Without it there is nothing to build.

use std::env;
use std::path::PathBuf;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=csrc/shan_mpi.c");
    println!("cargo:rerun-if-changed=csrc/shan_mpi.h");
    println!("cargo:rerun-if-env-changed=MPI_PKG_CONFIG");
    println!("cargo:rerun-if-env-changed=MPICC");

    if env::var_os("CARGO_FEATURE_MPI").is_none() {
        return;
    }

    let mpi_config = find_mpi_config();

    let mut build = cc::Build::new();
    build
        .file("csrc/shan_mpi.c")
        .include("csrc")
        .warnings(true)
        .extra_warnings(true);

    for path in &mpi_config.include_paths {
        build.include(path);
    }

    if env::var("PROFILE").unwrap_or_default() == "release" {
        build.opt_level(3);
    }

    build.compile("shan_mpi");

    for path in &mpi_config.link_paths {
        println!("cargo:rustc-link-search=native={}", path.display());
        println!("cargo:rustc-link-arg=-Wl,-rpath,{}", path.display());
    }

    for lib in &mpi_config.libs {
        println!("cargo:rustc-link-lib={lib}");
    }

    if let Some(version) = mpi_config.version {
        println!("cargo:rustc-env=SHAN_MPI_VERSION={version}");
    }
}

struct MpiConfig {
    include_paths: Vec<PathBuf>,
    link_paths: Vec<PathBuf>,
    libs: Vec<String>,
    version: Option<String>,
}

impl MpiConfig {
    fn prefix(prefix: &str) -> Self {
        MpiConfig {
            include_paths: vec![PathBuf::from(format!("{prefix}/include"))],
            link_paths: vec![PathBuf::from(format!("{prefix}/lib"))],
            libs: vec!["mpi".to_string()],
            version: None,
        }
    }
}

/// Locate MPI, in order: `MPI_PKG_CONFIG`, well-known pkg-config names,
/// `mpicc -show`, `CRAY_MPICH_DIR`, common prefixes.
fn find_mpi_config() -> MpiConfig {
    let mut pkg_names: Vec<String> = env::var("MPI_PKG_CONFIG").into_iter().collect();
    pkg_names.extend(["mpich", "ompi", "mpi"].map(String::from));
    for name in &pkg_names {
        if let Ok(config) = try_pkg_config(name) {
            eprintln!("shan: MPI from pkg-config '{name}'");
            return config;
        }
    }

    match try_mpicc() {
        Ok(config) => {
            eprintln!("shan: MPI from mpicc -show");
            return config;
        }
        Err(err) => eprintln!("shan: {err}"),
    }

    if let Ok(dir) = env::var("CRAY_MPICH_DIR") {
        eprintln!("shan: Cray MPICH at {dir}");
        return MpiConfig::prefix(&dir);
    }

    let found = ["/usr", "/usr/local", "/opt/mpich", "/opt/openmpi"]
        .into_iter()
        .find(|prefix| PathBuf::from(format!("{prefix}/include/mpi.h")).exists());
    if let Some(prefix) = found {
        eprintln!("shan: mpi.h under {prefix}");
        return MpiConfig::prefix(prefix);
    }

    panic!(
        "the `mpi` feature needs an MPI installation; set MPI_PKG_CONFIG (e.g. 'mpich'), \
         put mpicc on PATH (or set MPICC), or set CRAY_MPICH_DIR"
    );
}

fn try_pkg_config(name: &str) -> Result<MpiConfig, pkg_config::Error> {
    let lib = pkg_config::Config::new().cargo_metadata(false).probe(name)?;
    Ok(MpiConfig {
        include_paths: lib.include_paths,
        link_paths: lib.link_paths,
        libs: lib.libs,
        version: Some(lib.version),
    })
}

fn try_mpicc() -> Result<MpiConfig, String> {
    let mpicc = env::var("MPICC").unwrap_or_else(|_| "mpicc".to_string());
    let output = Command::new(&mpicc)
        .arg("-show")
        .output()
        .map_err(|e| format!("cannot run '{mpicc}': {e}"))?;
    if !output.status.success() {
        return Err(format!("'{mpicc} -show' failed"));
    }

    let mut config = MpiConfig {
        include_paths: Vec::new(),
        link_paths: Vec::new(),
        libs: Vec::new(),
        version: None,
    };
    for flag in String::from_utf8_lossy(&output.stdout).split_whitespace() {
        if let Some(path) = flag.strip_prefix("-I") {
            config.include_paths.push(PathBuf::from(path));
        } else if let Some(path) = flag.strip_prefix("-L") {
            config.link_paths.push(PathBuf::from(path));
        } else if let Some(lib) = flag.strip_prefix("-l") {
            config.libs.push(lib.to_string());
        }
    }
    if config.libs.is_empty() {
        config.libs.push("mpi".to_string());
    }
    Ok(config)
}
