//! Linux backend: crosstool-ng gcc toolchains and a full set of dependencies.

use std::collections::BTreeMap;

use super::{
    autotools, disable_modules, entry, path_with, step, substitute, Backend, EnvContext,
    InterpreterContext, PYTHON_URL,
};
use crate::arch::Platform;
use crate::manifest::{Manifest, Patch, Recipe};
use crate::process::StepCommand;
use crate::relocate::LauncherStyle;

pub struct Linux;

impl Backend for Linux {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn build_env(&self, ctx: &EnvContext) -> BTreeMap<String, String> {
        let tc = ctx.toolchain;
        let prefix = ctx.prefix.display();
        let bin = tc.root.join("bin");
        let mut env = BTreeMap::new();

        env.insert(
            "CC".to_string(),
            format!("{}/{}-gcc -no-pie", bin.display(), tc.triplet),
        );
        env.insert(
            "CXX".to_string(),
            format!("{}/{}-g++ -no-pie", bin.display(), tc.triplet),
        );
        env.insert(
            "PATH".to_string(),
            path_with(&[&bin, &ctx.prefix.join("bin")], ctx.search_path),
        );

        // The rpath reserves room in .dynstr for the relative entry written
        // during relocation.
        let mut ldflags = vec![format!("-Wl,--rpath={prefix}/lib"), format!("-L{prefix}/lib")];
        let mut cflags = vec![format!("-L{prefix}/lib")];
        if let Some(sysroot) = &tc.sysroot {
            ldflags.push(format!("-L{}/lib", sysroot.display()));
            cflags.push(format!("-L{}/lib", sysroot.display()));
        }
        ldflags.push("-static-libstdc++".to_string());
        cflags.extend([
            format!("-I{prefix}/include"),
            format!("-I{prefix}/include/readline"),
            format!("-I{prefix}/include/ncursesw"),
        ]);
        if let Some(sysroot) = &tc.sysroot {
            cflags.push(format!("-I{}/usr/include", sysroot.display()));
        }
        let cflags = cflags.join(" ");
        env.insert("LDFLAGS".to_string(), ldflags.join(" "));
        env.insert("CFLAGS".to_string(), cflags.clone());
        env.insert("CPPFLAGS".to_string(), cflags.clone());
        env.insert("CXXFLAGS".to_string(), cflags);
        env.insert(
            "PKG_CONFIG_PATH".to_string(),
            format!("{prefix}/lib/pkgconfig"),
        );

        env.insert("PORTABLE_BUILD".to_string(), ctx.build_triplet.to_string());
        env.insert("PORTABLE_HOST".to_string(), ctx.host_triplet.to_string());
        env.insert("PORTABLE_BUILD_ARCH".to_string(), ctx.pair.host.to_string());
        env.insert("PORTABLE_HOST_ARCH".to_string(), ctx.pair.target.to_string());
        env
    }

    fn cross_args(&self, ctx: &EnvContext) -> Vec<String> {
        vec![
            format!("--build={}", ctx.build_triplet),
            format!("--host={}", ctx.host_triplet),
        ]
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
                        "linux-{env.PORTABLE_HOST_ARCH}",
                        "--prefix={prefix}",
                        "--openssldir=/etc/ssl",
                        "--libdir=lib",
                        "--api=1.1.1",
                        "-Wl,-z,noexecstack",
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

        let mut bzip2 = entry(
            "bzip2",
            "1.0.8",
            "https://sourceware.org/pub/bzip2/bzip2-{version}.tar.gz",
        );
        bzip2.recipe = Recipe::Steps {
            steps: vec![
                step(
                    "make",
                    &[
                        "-j{jobs}",
                        "PREFIX={prefix}",
                        "LDFLAGS={env.LDFLAGS}",
                        "CFLAGS=-fPIC",
                        "CC={env.CC}",
                        "install",
                    ],
                ),
                step(
                    "make",
                    &[
                        "-f",
                        "Makefile-libbz2_so",
                        "CC={env.CC}",
                        "LDFLAGS={env.LDFLAGS}",
                    ],
                ),
                step("cp", &["libbz2.so.1.0.8", "{prefix}/lib/"]),
            ],
        };

        let mut gdbm = entry(
            "gdbm",
            "1.23",
            "https://ftp.gnu.org/gnu/gdbm/gdbm-{version}.tar.gz",
        );
        gdbm.recipe = autotools(&["--enable-libgdbm-compat"]);

        let readline = entry(
            "readline",
            "8.2",
            "https://ftp.gnu.org/gnu/readline/readline-{version}.tar.gz",
        );

        let mut ncurses = entry(
            "ncurses",
            "6.4",
            "https://ftp.gnu.org/pub/gnu/ncurses/ncurses-{version}.tar.gz",
        );
        ncurses.recipe = autotools(&[
            "--with-shared",
            "--without-cxx-shared",
            "--without-static",
            "--without-cxx",
            "--enable-widec",
            "--without-normal",
            "--disable-stripping",
            "--without-progs",
            "--disable-db-install",
        ]);
        ncurses.after = vec!["readline".to_string()];

        let mut libffi = entry(
            "libffi",
            "3.4.4",
            "https://github.com/libffi/libffi/releases/download/v{version}/libffi-{version}.tar.gz",
        );
        libffi.recipe = Recipe::Steps {
            steps: vec![
                step(
                    "./configure",
                    &[
                        "--prefix={prefix}",
                        "--disable-multi-os-directory",
                        "--build={build}",
                        "--host={host}",
                    ],
                ),
                // libffi ignores --libdir and installs into lib64.
                step("sed", &["-i", "s/lib64/lib/g", "Makefile"]),
                step("make", &["-j{jobs}"]),
                step("make", &["install"]),
            ],
        };

        let mut zlib = entry("zlib", "1.2.13", "https://zlib.net/fossils/zlib-{version}.tar.gz");
        let mut configure = step(
            "./configure",
            &["--prefix={prefix}", "--libdir={prefix}/lib", "--shared"],
        );
        configure
            .env
            .insert("CFLAGS".to_string(), "-fPIC {env.CFLAGS}".to_string());
        zlib.recipe = Recipe::Steps {
            steps: vec![
                configure,
                step("make", &["-j{jobs}"]),
                step("make", &["install"]),
            ],
        };

        let uuid = entry(
            "uuid",
            "1.0.3",
            "https://sourceforge.net/projects/libuuid/files/libuuid-{version}.tar.gz",
        );

        let mut krb5 = entry(
            "krb5",
            "1.20",
            "https://kerberos.org/dist/krb5/{version}/krb5-{version}.tar.gz",
        );
        krb5.recipe = Recipe::Autotools {
            args: vec![
                "--without-system-verto".to_string(),
                "--without-libedit".to_string(),
            ],
            subdir: Some("src".to_string()),
            native_only: false,
        };
        // Configure cannot probe these when the result has to run on the target.
        for (key, value) in [
            ("krb5_cv_attr_constructor_destructor", "yes,yes"),
            ("ac_cv_func_regcomp", "yes"),
            ("ac_cv_printf_positional", "yes"),
        ] {
            krb5.env.insert(key.to_string(), value.to_string());
        }
        krb5.after = vec!["openssl".to_string()];

        let mut python = entry("python", version, PYTHON_URL);
        python.patches = vec![
            substitute(
                "configure",
                "ac_cv_buggy_getaddrinfo=yes",
                "ac_cv_buggy_getaddrinfo=no",
            ),
            substitute(
                "configure",
                "ac_cv_enable_implicit_function_declaration_error=yes",
                "ac_cv_enable_implicit_function_declaration_error=no",
            ),
            // setup.py is gone from 3.12 onwards.
            Patch::Substitute {
                file: "setup.py".to_string(),
                from: "    def add_multiarch_paths(self):\n".to_string(),
                to: "    def add_multiarch_paths(self):\n        return\n".to_string(),
                optional: true,
            },
            disable_modules(&["_tkinter", "nsl", "nis"]),
        ];

        Manifest {
            dependencies: vec![
                openssl, xz, sqlite, bzip2, gdbm, readline, ncurses, libffi, zlib, uuid, krb5,
            ],
            interpreter: python,
        }
    }

    fn launcher(&self) -> LauncherStyle {
        LauncherStyle::Linux
    }

    fn interpreter_steps(
        &self,
        ctx: &InterpreterContext,
        env: &BTreeMap<String, String>,
    ) -> Vec<StepCommand> {
        let prefix = ctx.env.prefix.display();
        let mut configure = StepCommand::new("./configure", ctx.source)
            .args([
                "-v".to_string(),
                format!("--prefix={prefix}"),
                format!("--with-openssl={prefix}"),
                "--enable-optimizations".to_string(),
                "--with-ensurepip=no".to_string(),
                format!("--build={}", ctx.env.build_triplet),
                format!("--host={}", ctx.env.host_triplet),
                "--disable-test-modules".to_string(),
            ])
            .envs(env);
        if let Some(native) = ctx.build_python {
            configure = configure.arg(format!("--with-build-python={}", native.display()));
        }
        configure = configure.args(["ac_cv_file__dev_ptmx=yes", "ac_cv_file__dev_ptc=no"]);

        vec![
            configure,
            StepCommand::new("make", ctx.source)
                .arg(format!("-j{}", ctx.jobs))
                .envs(env),
            StepCommand::new("make", ctx.source).arg("install").envs(env),
        ]
    }

    fn runtime_libraries(&self) -> &'static [&'static str] {
        &["libstdc++.so.6"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchPair, Architecture};
    use crate::toolchain::Toolchain;
    use std::path::{Path, PathBuf};

    fn toolchain() -> Toolchain {
        let root = PathBuf::from("/cache/x86_64-aarch64");
        Toolchain {
            pair: ArchPair::new(Architecture::X86_64, Architecture::Aarch64),
            triplet: "aarch64-linux-gnu".to_string(),
            version: "1".to_string(),
            compiler: root.join("bin/aarch64-linux-gnu-gcc"),
            sysroot: Some(root.join("aarch64-linux-gnu/sysroot")),
            root,
        }
    }

    fn env_ctx<'a>(tc: &'a Toolchain, prefix: &'a Path) -> EnvContext<'a> {
        EnvContext {
            pair: tc.pair,
            toolchain: tc,
            prefix,
            build_triplet: "x86_64-linux-gnu",
            host_triplet: "aarch64-linux-gnu",
            search_path: "/usr/bin:/bin",
        }
    }

    #[test]
    fn environment_points_at_toolchain_and_prefix() {
        let tc = toolchain();
        let prefix = Path::new("/data/build/3.10.13-aarch64-linux-gnu");
        let env = Linux.build_env(&env_ctx(&tc, prefix));

        assert_eq!(
            env["CC"],
            "/cache/x86_64-aarch64/bin/aarch64-linux-gnu-gcc -no-pie"
        );
        assert!(env["LDFLAGS"]
            .starts_with("-Wl,--rpath=/data/build/3.10.13-aarch64-linux-gnu/lib "));
        assert!(env["CFLAGS"].contains("-I/cache/x86_64-aarch64/aarch64-linux-gnu/sysroot/usr/include"));
        assert_eq!(
            env["PATH"],
            "/cache/x86_64-aarch64/bin:/data/build/3.10.13-aarch64-linux-gnu/bin:/usr/bin:/bin"
        );
        assert_eq!(env["PORTABLE_HOST_ARCH"], "aarch64");
        assert_eq!(env["PORTABLE_BUILD_ARCH"], "x86_64");
    }

    #[test]
    fn manifest_is_ordered() {
        let manifest = Linux.manifest("3.10.13");
        manifest.validate().unwrap();
        let names: Vec<_> = manifest.dependencies.iter().map(|d| d.name.as_str()).collect();
        let position = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(position("openssl") < position("krb5"));
        assert!(position("readline") < position("ncurses"));
        assert_eq!(
            manifest.interpreter.urls(),
            vec!["https://www.python.org/ftp/python/3.10.13/Python-3.10.13.tar.xz"]
        );
    }

    #[test]
    fn cross_interpreter_uses_build_python() {
        let tc = toolchain();
        let prefix = Path::new("/p");
        let env_ctx = env_ctx(&tc, prefix);
        let native = PathBuf::from("/data/build/3.10.13-x86_64-linux-gnu/bin/python3");
        let ctx = InterpreterContext {
            env: &env_ctx,
            source: Path::new("/src/Python-3.10.13"),
            jobs: 4,
            build_python: Some(&native),
        };
        let steps = Linux.interpreter_steps(&ctx, &BTreeMap::new());
        let rendered: Vec<_> = steps.iter().map(|s| s.to_string()).collect();
        assert!(rendered[0].contains("--host=aarch64-linux-gnu"));
        assert!(rendered[0].contains(
            "--with-build-python=/data/build/3.10.13-x86_64-linux-gnu/bin/python3"
        ));
        assert_eq!(rendered[1], "make -j4");
        assert_eq!(rendered[2], "make install");
    }
}
