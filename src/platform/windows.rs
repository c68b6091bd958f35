//! Windows backend. The interpreter is built with its bundled MSBuild scripts
//! and all dependencies come from the CPython source tree.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{entry, Backend, EnvContext, InterpreterContext, PYTHON_URL};
use crate::arch::{Architecture, Platform};
use crate::error::{Error, IoContext, Result};
use crate::manifest::Manifest;
use crate::process::StepCommand;
use crate::relocate::LauncherStyle;
use crate::utils::copy_tree;

pub struct Windows;

/// MSBuild platform name for `arch`.
fn msbuild_platform(arch: Architecture) -> &'static str {
    match arch {
        Architecture::X86 => "win32",
        Architecture::Arm64 | Architecture::Aarch64 => "arm64",
        Architecture::Amd64 | Architecture::X86_64 => "x64",
    }
}

/// Where `build.bat` leaves its outputs.
fn output_dir(source: &Path, arch: Architecture) -> PathBuf {
    let dir = match arch {
        Architecture::Amd64 => "amd64",
        other => msbuild_platform(other),
    };
    source.join("PCbuild").join(dir)
}

/// `3.10.13` -> `310`.
fn dll_version(version: &str) -> String {
    version.split('.').take(2).collect()
}

fn move_into(file: &Path, dir: &Path) -> Result<()> {
    if !file.exists() {
        return Err(Error::MissingArtifact(file.to_path_buf()));
    }
    let name = file
        .file_name()
        .ok_or_else(|| Error::MissingArtifact(file.to_path_buf()))?;
    let dest = dir.join(name);
    fs::rename(file, &dest).with_path(&dest)
}

impl Backend for Windows {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn build_env(&self, ctx: &EnvContext) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("MSBUILDDISABLENODEREUSE".to_string(), "1".to_string());
        env.insert("PORTABLE_BUILD".to_string(), ctx.build_triplet.to_string());
        env.insert("PORTABLE_HOST".to_string(), ctx.host_triplet.to_string());
        env.insert("PORTABLE_BUILD_ARCH".to_string(), ctx.pair.host.to_string());
        env.insert("PORTABLE_HOST_ARCH".to_string(), ctx.pair.target.to_string());
        env
    }

    fn cross_args(&self, _ctx: &EnvContext) -> Vec<String> {
        Vec::new()
    }

    fn manifest(&self, version: &str) -> Manifest {
        Manifest {
            dependencies: Vec::new(),
            interpreter: entry("python", version, PYTHON_URL),
        }
    }

    fn launcher(&self) -> LauncherStyle {
        // Windows trees carry no shell launchers; scripts are left alone
        // unless they use a POSIX shebang.
        LauncherStyle::Linux
    }

    fn interpreter_steps(
        &self,
        ctx: &InterpreterContext,
        env: &BTreeMap<String, String>,
    ) -> Vec<StepCommand> {
        let script = ctx.source.join("PCbuild").join("build.bat");
        vec![StepCommand::new(script.display().to_string(), ctx.source)
            .args(["-p", msbuild_platform(ctx.env.pair.target), "--no-tkinter"])
            .envs(env)]
    }

    fn install_layout(&self, ctx: &InterpreterContext, version: &str) -> Result<()> {
        let source = ctx.source;
        let prefix = ctx.env.prefix;
        let built = output_dir(source, ctx.env.pair.target);
        let short = dll_version(version);

        let scripts = prefix.join("Scripts");
        fs::create_dir_all(&scripts).with_path(&scripts)?;
        let python_dll = format!("python{short}.dll");
        for name in [
            "py.exe",
            "pyw.exe",
            "python.exe",
            "pythonw.exe",
            "python3.dll",
            python_dll.as_str(),
            "vcruntime140.dll",
            "venvlauncher.exe",
            "venvwlauncher.exe",
        ] {
            move_into(&built.join(name), &scripts)?;
        }

        let dlls = prefix.join("DLLs");
        fs::create_dir_all(&dlls).with_path(&dlls)?;
        for entry in fs::read_dir(&built).with_path(&built)? {
            let path = entry.with_path(&built)?.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("pyd") | Some("dll")) {
                move_into(&path, &dlls)?;
            }
        }

        let include = prefix.join("Include");
        copy_tree(&source.join("Include"), &include)?;
        let pyconfig = source.join("PC").join("pyconfig.h");
        fs::copy(&pyconfig, include.join("pyconfig.h")).with_path(&pyconfig)?;

        copy_tree(&source.join("Lib"), &prefix.join("Lib"))?;
        let site = prefix.join("Lib").join("site-packages");
        fs::create_dir_all(&site).with_path(&site)?;

        let libs = prefix.join("libs");
        fs::create_dir_all(&libs).with_path(&libs)?;
        for name in ["python3.lib".to_string(), format!("python{short}.lib")] {
            let from = built.join(&name);
            fs::copy(&from, libs.join(&name)).with_path(&from)?;
        }
        Ok(())
    }
}
