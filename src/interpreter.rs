//! Interpreter builder.
//!
//! Configures and compiles the interpreter against the prefix the sequencer
//! populated, then finalizes the tree: a startup hook that keeps `sys.path`
//! inside the installation and points OpenSSL at the bundled provider
//! modules and the host's certificates, build-time paths in `_sysconfigdata`
//! replaced by placeholders resolved at import, and the toolchain runtime
//! libraries the binaries were linked against.
//!
//! A cross tree gets `pip` from the native interpreter of the same version.
//! `PORTABLE_CROSS` tells that interpreter's hook to adopt the cross tree as
//! its prefix for the duration of the install.

use indoc::indoc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::deps::{apply_patches, BuildContext, BuiltDependency, Sequencer};
use crate::error::{Error, IoContext, Result};
use crate::manifest::Manifest;
use crate::platform::InterpreterContext;
use crate::process::StepCommand;
use crate::tree::BuildTree;
use crate::utils::write_atomic;

pub const BUILDROOT: &str = "{BUILDROOT}";
pub const TOOLCHAIN: &str = "{TOOLCHAIN}";

const PTH_FILE: &str = "_portable.pth";
const RUNTIME_MODULE: &str = "_portable_runtime.py";

const PTH: &str = "import _portable_runtime\n";

/// Set while a native interpreter installs into a cross-built tree.
pub const CROSS_ENV: &str = "PORTABLE_CROSS";

const RUNTIME: &str = indoc! {r#"
    """Keep the module search path inside this installation and point OpenSSL
    at the modules shipped with it and the certificates of the host system."""
    import ctypes
    import os
    import shutil
    import subprocess
    import sys


    def _sanitize():
        prefix = os.path.realpath(sys.prefix)
        extra = [p for p in os.environ.get("PYTHONPATH", "").split(os.pathsep) if p]
        keep = []
        for entry in sys.path:
            real = os.path.realpath(entry) if entry else entry
            if (
                not entry
                or entry in extra
                or real == prefix
                or real.startswith(prefix + os.sep)
            ):
                keep.append(entry)
        sys.path[:] = keep


    def _crossroot(cross):
        root = os.path.realpath(cross)
        sys.prefix = root
        sys.exec_prefix = root
        lib = os.path.join(root, "lib", "python{}.{}".format(*sys.version_info[:2]))
        sys.path[:] = [
            lib,
            os.path.join(lib, "lib-dynload"),
            os.path.join(lib, "site-packages"),
        ] + [p for p in sys.path if "site-packages" not in p]


    def _openssl_dir(openssl, flag):
        proc = subprocess.run(
            [openssl, "version", flag], capture_output=True, text=True, check=False
        )
        if proc.returncode != 0 or ":" not in proc.stdout:
            return None
        return proc.stdout.split(":", 1)[1].strip().strip('"')


    def _libcrypto():
        name = "libcrypto.dylib" if sys.platform == "darwin" else "libcrypto.so"
        try:
            return ctypes.CDLL(os.path.join(sys.prefix, "lib", name))
        except OSError:
            return None


    def _provider_path(libcrypto, path):
        func = getattr(libcrypto, "OSSL_PROVIDER_set_default_search_path", None)
        if func is not None:
            func.argtypes = (ctypes.c_void_p, ctypes.c_char_p)
            func.restype = ctypes.c_int
            func(None, path.encode())


    def _load_provider(libcrypto, name):
        func = getattr(libcrypto, "OSSL_PROVIDER_load", None)
        if func is not None:
            func.argtypes = (ctypes.c_void_p, ctypes.c_char_p)
            func.restype = ctypes.c_void_p
            func(None, name.encode())


    def _setup_openssl():
        if sys.platform == "win32":
            return
        openssl = shutil.which("openssl")
        if "OPENSSL_MODULES" not in os.environ:
            libcrypto = _libcrypto()
            if libcrypto is not None:
                system = openssl and _openssl_dir(openssl, "-m")
                if system:
                    _provider_path(libcrypto, system)
                    _load_provider(libcrypto, "fips")
                _provider_path(libcrypto, os.path.join(sys.prefix, "lib", "ossl-modules"))
                _load_provider(libcrypto, "default")
                _load_provider(libcrypto, "legacy")
        if openssl and not os.environ.get("SSL_CERT_DIR"):
            directory = _openssl_dir(openssl, "-d")
            if directory:
                os.environ["SSL_CERT_DIR"] = os.path.join(directory, "certs")
                cert = os.path.join(directory, "cert.pem")
                if os.path.exists(cert) and not os.environ.get("SSL_CERT_FILE"):
                    os.environ["SSL_CERT_FILE"] = cert


    _cross = os.environ.get("PORTABLE_CROSS", "")
    if _cross:
        _crossroot(_cross)
    else:
        _sanitize()
        try:
            _setup_openssl()
        except OSError:
            pass
"#};

const RESOLVER_MARKER: &str = "def _portable_resolve(";

const RESOLVER: &str = indoc! {r#"


    def _portable_resolve(data):
        import os
        import sys

        toolchain = os.environ.get("PORTABLE_TOOLCHAIN", "")
        for key, value in data.items():
            if isinstance(value, str):
                value = value.replace("{BUILDROOT}", sys.prefix)
                data[key] = value.replace("{TOOLCHAIN}", toolchain)


    _portable_resolve(build_time_vars)
"#};

#[derive(Debug, Clone, Copy, Default)]
pub struct InterpreterOptions {
    /// Bootstrap pip into the tree after building.
    pub ensurepip: bool,
}

pub struct InterpreterBuilder<'a> {
    sequencer: &'a Sequencer,
    options: InterpreterOptions,
}

impl<'a> InterpreterBuilder<'a> {
    pub fn new(sequencer: &'a Sequencer, options: InterpreterOptions) -> Self {
        Self { sequencer, options }
    }

    /// Build the interpreter of `manifest` into `tree`.
    ///
    /// `build_python` is the interpreter of a native tree of the same version.
    /// Cross builds run code generation with it and fail with
    /// [`Error::NativeBuildRequired`] before fetching anything if it is absent.
    pub fn build(
        &self,
        manifest: &Manifest,
        tree: &BuildTree,
        ctx: &BuildContext,
        build_python: Option<&Path>,
    ) -> Result<BuiltDependency> {
        let pair = ctx.target.pair;
        let build_python = if pair.is_cross() {
            match build_python {
                Some(path) if path.exists() => Some(path),
                other => {
                    return Err(Error::NativeBuildRequired {
                        version: tree.version.clone(),
                        pair,
                        native: other.map(Path::to_path_buf).unwrap_or_default(),
                    })
                }
            }
        } else {
            None
        };

        let entry = &manifest.interpreter;
        info!(version = %entry.version, %pair, "building interpreter");
        let log = ctx.log(&entry.name);
        let (source, built) = self.sequencer.prepare(entry, ctx)?;
        apply_patches(
            self.sequencer.runner(),
            &entry.name,
            &entry.patches,
            &source,
            &log,
        )?;

        let ictx = InterpreterContext {
            env: ctx.target,
            source: &source,
            jobs: ctx.jobs,
            build_python,
        };
        for command in ctx.backend.interpreter_steps(&ictx, ctx.env) {
            self.sequencer.step(&entry.name, &command, &log)?;
        }
        ctx.backend.install_layout(&ictx, &tree.version)?;

        self.finalize(tree, ctx, build_python, &log)?;
        Ok(built)
    }

    fn finalize(
        &self,
        tree: &BuildTree,
        ctx: &BuildContext,
        build_python: Option<&Path>,
        log: &Path,
    ) -> Result<()> {
        let interpreter = tree.interpreter();
        if !interpreter.exists() {
            return Err(Error::MissingArtifact(interpreter));
        }
        install_runtime(&tree.site_packages())?;
        if let Some(data) = find_sysconfigdata(&tree.stdlib_dir())? {
            rewrite_sysconfigdata(&data, &tree.root, &ctx.target.toolchain.root)?;
        } else {
            debug!(tree = %tree.root.display(), "no _sysconfigdata module");
        }
        copy_runtime_libraries(ctx, tree)?;

        if self.options.ensurepip {
            let python = build_python.unwrap_or(&interpreter);
            let mut command = StepCommand::new(python.display().to_string(), &tree.root)
                .args(["-m", "ensurepip"])
                .envs(ctx.env);
            // The native interpreter's startup hook redirects the install here.
            if build_python.is_some() {
                command
                    .env
                    .insert(CROSS_ENV.to_string(), tree.root.display().to_string());
            }
            self.sequencer.step("ensurepip", &command, log)?;
        }
        Ok(())
    }
}

/// Install the startup hook that sanitizes `sys.path`.
pub fn install_runtime(site_packages: &Path) -> Result<()> {
    fs::create_dir_all(site_packages).with_path(site_packages)?;
    let pth = site_packages.join(PTH_FILE);
    fs::write(&pth, PTH).with_path(&pth)?;
    let module = site_packages.join(RUNTIME_MODULE);
    fs::write(&module, RUNTIME).with_path(&module)
}

/// The `_sysconfigdata*.py` module of a stdlib directory, if any.
pub fn find_sysconfigdata(stdlib: &Path) -> Result<Option<PathBuf>> {
    if !stdlib.is_dir() {
        return Ok(None);
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(stdlib).with_path(stdlib)? {
        let path = entry.with_path(stdlib)?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.starts_with("_sysconfigdata") && name.ends_with(".py") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found.into_iter().next())
}

/// Replace the build prefix and toolchain root in `path` with placeholders
/// and append the resolver that substitutes them at import time.
pub fn rewrite_sysconfigdata(path: &Path, prefix: &Path, toolchain: &Path) -> Result<()> {
    let text = fs::read_to_string(path).with_path(path)?;
    let mut pairs = [
        (prefix.display().to_string(), BUILDROOT),
        (toolchain.display().to_string(), TOOLCHAIN),
    ];
    // Longest first so a path nested in the other is not split.
    pairs.sort_by_key(|(from, _)| std::cmp::Reverse(from.len()));
    let mut out = text.clone();
    for (from, to) in &pairs {
        if !from.is_empty() {
            out = out.replace(from.as_str(), to);
        }
    }
    if !out.contains(RESOLVER_MARKER) {
        out.push_str(RESOLVER);
    }
    if out != text {
        info!(path = %path.display(), "rewrote build-time paths");
        write_atomic(path, out.as_bytes())?;
    }
    Ok(())
}

fn copy_runtime_libraries(ctx: &BuildContext, tree: &BuildTree) -> Result<()> {
    let names = ctx.backend.runtime_libraries();
    if names.is_empty() {
        return Ok(());
    }
    let Some(sysroot) = &ctx.target.toolchain.sysroot else {
        warn!("toolchain has no sysroot; runtime libraries not copied");
        return Ok(());
    };
    let lib = tree.lib_dir();
    fs::create_dir_all(&lib).with_path(&lib)?;
    for name in names {
        let from = sysroot.join("lib").join(name);
        if !from.exists() {
            return Err(Error::MissingArtifact(from));
        }
        let to = lib.join(name);
        fs::copy(&from, &to).with_path(&to)?;
    }
    Ok(())
}
