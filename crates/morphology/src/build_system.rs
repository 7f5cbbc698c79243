//! Build-system registry.
//!
//! Each known build system supplies default commands for the phases a chunk
//! leaves unspecified. `manual` supplies nothing: every phase the chunk does
//! not declare is a no-op.

use crate::schema::Phase;

/// Default phase commands for one build system.
#[derive(Debug, Clone, Copy)]
pub struct BuildSystem {
    /// Registry name, as written in `build-system:`.
    pub name: &'static str,
    configure: &'static [&'static str],
    build: &'static [&'static str],
    install: &'static [&'static str],
}

impl BuildSystem {
    /// Default commands for a phase. Pre/post phases never have defaults.
    #[must_use]
    pub fn default_commands(&self, phase: Phase) -> &'static [&'static str] {
        match phase {
            Phase::Configure => self.configure,
            Phase::Build => self.build,
            Phase::Install => self.install,
            _ => &[],
        }
    }
}

const MANUAL: BuildSystem = BuildSystem {
    name: "manual",
    configure: &[],
    build: &[],
    install: &[],
};

const AUTOTOOLS: BuildSystem = BuildSystem {
    name: "autotools",
    configure: &[
        "export NOCONFIGURE=1; if [ -e autogen ]; then ./autogen; \
         elif [ -e autogen.sh ]; then ./autogen.sh; \
         elif [ ! -e ./configure ]; then autoreconf -ivf; fi",
        "./configure --prefix=\"$PREFIX\"",
    ],
    build: &["make"],
    install: &["make DESTDIR=\"$DESTDIR\" install"],
};

const CMAKE: BuildSystem = BuildSystem {
    name: "cmake",
    configure: &["cmake -DCMAKE_INSTALL_PREFIX=\"$PREFIX\" ."],
    build: &["make"],
    install: &["make DESTDIR=\"$DESTDIR\" install"],
};

const PYTHON_DISTUTILS: BuildSystem = BuildSystem {
    name: "python-distutils",
    configure: &[],
    build: &["python setup.py build"],
    install: &["python setup.py install --prefix \"$PREFIX\" --root \"$DESTDIR\""],
};

const REGISTRY: [&BuildSystem; 4] = [&MANUAL, &AUTOTOOLS, &CMAKE, &PYTHON_DISTUTILS];

/// Look up a build system by name.
#[must_use]
pub fn build_system(name: &str) -> Option<&'static BuildSystem> {
    REGISTRY.iter().find(|bs| bs.name == name).copied()
}

/// Whether `name` is a registered build system.
#[must_use]
pub fn is_known_build_system(name: &str) -> bool {
    build_system(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_systems() {
        for name in ["manual", "autotools", "cmake", "python-distutils"] {
            assert!(is_known_build_system(name), "{name} should be known");
        }
        assert!(!is_known_build_system("meson"));
    }

    #[test]
    fn manual_has_no_defaults() {
        let bs = build_system("manual").unwrap();
        for phase in Phase::ALL {
            assert!(bs.default_commands(phase).is_empty());
        }
    }

    #[test]
    fn autotools_defaults() {
        let bs = build_system("autotools").unwrap();
        assert_eq!(bs.default_commands(Phase::Build), ["make"]);
        assert!(bs.default_commands(Phase::PreBuild).is_empty());
        assert!(
            bs.default_commands(Phase::Install)[0].contains("DESTDIR"),
            "install must honour DESTDIR"
        );
    }
}
