//! macOS backend. Builds with the system clang; only native pairs are supported.

use std::collections::BTreeMap;

use super::{
    autotools, disable_modules, entry, path_with, step, Backend, EnvContext, InterpreterContext,
    PYTHON_URL,
};
use crate::arch::Platform;
use crate::manifest::{Manifest, Recipe};
use crate::process::StepCommand;
use crate::relocate::LauncherStyle;

pub const DEPLOYMENT_TARGET: &str = "10.15";

pub struct Darwin;

impl Backend for Darwin {
    fn platform(&self) -> Platform {
        Platform::Darwin
    }

    fn build_env(&self, ctx: &EnvContext) -> BTreeMap<String, String> {
        let prefix = ctx.prefix.display();
        let mut env = BTreeMap::new();
        env.insert(
            "CC".to_string(),
            ctx.toolchain.compiler.display().to_string(),
        );
        env.insert("PATH".to_string(), path_with(&[&ctx.prefix.join("bin")], ctx.search_path));
        env.insert(
            "LDFLAGS".to_string(),
            format!("-Wl,-rpath,{prefix}/lib -L{prefix}/lib"),
        );
        env.insert(
            "CFLAGS".to_string(),
            format!("-L{prefix}/lib -I{prefix}/include -I{prefix}/include/readline"),
        );
        env.insert(
            "MACOSX_DEPLOYMENT_TARGET".to_string(),
            DEPLOYMENT_TARGET.to_string(),
        );
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
        let mut openssl = entry(
            "openssl",
            "1.1.1t",
            "https://www.openssl.org/source/openssl-{version}.tar.gz",
        );
        openssl.recipe = Recipe::Steps {
            steps: vec![
                step(
                    "./Configure",
                    &[
                        "darwin64-{env.PORTABLE_HOST_ARCH}-cc",
                        "--prefix={prefix}",
                        "--openssldir=/etc/ssl",
                        "--libdir=lib",
                    ],
                ),
                step("make", &["-j{jobs}"]),
                step("make", &["install_sw"]),
            ],
        };

        let xz = entry("xz", "5.4.1", "http://tukaani.org/xz/xz-{version}.tar.gz");

        let mut sqlite = entry(
            "sqlite",
            "3400100",
            "https://sqlite.org/2022/sqlite-autoconf-{version}.tar.gz",
        );
        sqlite.recipe = autotools(&[
            "--with-shared",
            "--without-static",
            "--enable-threadsafe",
            "--disable-readline",
            "--disable-dependency-tracking",
        ]);

        let mut python = entry("python", version, PYTHON_URL);
        python.patches = vec![disable_modules(&["_tkinter", "nsl", "ncurses", "nis"])];

        Manifest {
            dependencies: vec![openssl, xz, sqlite],
            interpreter: python,
        }
    }

    fn launcher(&self) -> LauncherStyle {
        LauncherStyle::Darwin
    }

    fn interpreter_steps(
        &self,
        ctx: &InterpreterContext,
        env: &BTreeMap<String, String>,
    ) -> Vec<StepCommand> {
        let prefix = ctx.env.prefix.display();
        vec![
            StepCommand::new("./configure", ctx.source)
                .args([
                    "-v".to_string(),
                    format!("--prefix={prefix}"),
                    format!("--with-openssl={prefix}"),
                    "--enable-optimizations".to_string(),
                    "--disable-test-modules".to_string(),
                ])
                .envs(env),
            StepCommand::new("make", ctx.source)
                .arg(format!("-j{}", ctx.jobs))
                .envs(env),
            StepCommand::new("make", ctx.source).arg("install").envs(env),
        ]
    }
}
