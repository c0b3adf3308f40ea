//! Recipe catalog: recipes on disk, one TOML file per recipe.
//!
//! Layout: `<root>/servers/*.toml`, `<root>/monitors/*.toml`,
//! `<root>/clients/*.toml`. The file stem is the recipe name.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{RecipeError, RecipeResult};
use crate::recipe::*;

/// One catalog entry, as shown by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeSummary {
    pub name: String,
    pub kind: RecipeKind,
    pub service_name: String,
    pub description: String,
    pub path: PathBuf,
}

/// Directory-backed recipe lookup.
#[derive(Debug, Clone)]
pub struct RecipeCatalog {
    root: PathBuf,
}

impl RecipeCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, kind: RecipeKind, name: &str) -> PathBuf {
        self.root.join(kind.dir_name()).join(format!("{name}.toml"))
    }

    /// Load and validate a recipe, checking it really is of `kind`.
    pub fn load(&self, kind: RecipeKind, name: &str) -> RecipeResult<Recipe> {
        let path = self.path_for(kind, name);
        if !path.is_file() {
            return Err(RecipeError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                path,
            });
        }
        let recipe = Recipe::from_file(&path)?;
        if recipe.kind() != kind {
            return Err(RecipeError::WrongKind {
                name: name.to_string(),
                expected: kind.to_string(),
                found: recipe.kind().to_string(),
            });
        }
        debug!(%kind, %name, path = %path.display(), "recipe loaded");
        Ok(recipe)
    }

    pub fn load_server(&self, name: &str) -> RecipeResult<ServerRecipe> {
        match self.load(RecipeKind::Server, name)? {
            Recipe::Server(r) => Ok(r),
            other => Err(wrong_kind(name, RecipeKind::Server, &other)),
        }
    }

    pub fn load_monitor(&self, name: &str) -> RecipeResult<MonitorRecipe> {
        match self.load(RecipeKind::Monitor, name)? {
            Recipe::Monitor(r) => Ok(r),
            other => Err(wrong_kind(name, RecipeKind::Monitor, &other)),
        }
    }

    pub fn load_client(&self, name: &str) -> RecipeResult<ClientRecipe> {
        match self.load(RecipeKind::Client, name)? {
            Recipe::Client(r) => Ok(r),
            other => Err(wrong_kind(name, RecipeKind::Client, &other)),
        }
    }

    /// List the recipes of one kind, sorted by name.
    ///
    /// Files that fail to parse are skipped with a warning so one broken
    /// recipe does not hide the rest. A missing directory lists as empty.
    pub fn list(&self, kind: RecipeKind) -> RecipeResult<Vec<RecipeSummary>> {
        let dir = self.root.join(kind.dir_name());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(RecipeError::Io { path: dir, source }),
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| RecipeError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match Recipe::from_file(&path) {
                Ok(recipe) if recipe.kind() == kind => summaries.push(RecipeSummary {
                    name: recipe.name().to_string(),
                    kind,
                    service_name: recipe.service_name().to_string(),
                    description: recipe.description().to_string(),
                    path,
                }),
                Ok(recipe) => {
                    warn!(path = %path.display(), found = %recipe.kind(), expected = %kind, "skipping recipe of the wrong kind");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid recipe"),
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    /// Write a starter recipe for `kind` named `name`. Never overwrites.
    pub fn write_template(&self, kind: RecipeKind, name: &str) -> RecipeResult<PathBuf> {
        let path = self.path_for(kind, name);
        if path.exists() {
            return Err(RecipeError::AlreadyExists(path));
        }
        let recipe = scaffold(kind, name);
        recipe.validate()?;
        let content = recipe.to_toml_string()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RecipeError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, content).map_err(|source| RecipeError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

fn wrong_kind(name: &str, expected: RecipeKind, found: &Recipe) -> RecipeError {
    RecipeError::WrongKind {
        name: name.to_string(),
        expected: expected.to_string(),
        found: found.kind().to_string(),
    }
}

/// A minimal, valid recipe of the given kind.
pub fn scaffold(kind: RecipeKind, name: &str) -> Recipe {
    match kind {
        RecipeKind::Server => Recipe::Server(ServerRecipe {
            name: name.to_string(),
            service_name: Some(name.to_string()),
            description: format!("{name} server"),
            service: ServiceSpec {
                command: "python3 -m http.server 8000".to_string(),
                ports: vec![8000],
                image: None,
                working_dir: None,
            },
            resources: ResourceRequest {
                time_limit: Some("01:00:00".to_string()),
                ..ResourceRequest::default()
            },
            env: Default::default(),
        }),
        RecipeKind::Monitor => Recipe::Monitor(MonitorRecipe {
            name: name.to_string(),
            service_name: Some(name.to_string()),
            description: format!("{name} monitor"),
            service_kind: None,
            targets: vec![TargetSpec::implicit(name)],
            collector: CollectorSpec::default(),
            resources: ResourceRequest::default(),
        }),
        RecipeKind::Client => Recipe::Client(ClientRecipe {
            name: name.to_string(),
            service_name: Some(name.to_string()),
            description: format!("{name} benchmark client"),
            target: ClientTarget {
                protocol: "http".to_string(),
                ..ClientTarget::default()
            },
            workload: Workload {
                command: "curl -sf \"$UBENCH_TARGET_URL\"".to_string(),
                pattern: WorkloadPattern::ClosedLoop,
                duration_seconds: 60,
                concurrent_users: 1,
                requests_per_user: 10,
                think_time_ms: 0,
            },
            output: ClientOutput::default(),
            payload: None,
            headers: [("Content-Type".to_string(), "application/json".to_string())].into(),
            dataset: None,
            resources: ResourceRequest::default(),
            env: Default::default(),
        }),
    }
}
