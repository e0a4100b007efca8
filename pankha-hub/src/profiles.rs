//! Profile engine: the built-in library, user-authored curves, and portable
//! import/export. Profiles are immutable by content; editing one produces a
//! new id, so agents never see a curve change under them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use pankha_protocol::curves::{normalize_points, CurveError, CurvePoint, FanProfile};

pub const EXPORT_FORMAT: &str = "pankha-profiles";
pub const EXPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    Skip,
    Rename,
    Overwrite,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile not found: {0}")]
    NotFound(String),
    #[error("built-in profiles are read-only; clone instead")]
    SystemReadOnly,
    #[error(transparent)]
    InvalidCurve(#[from] CurveError),
    #[error("unsupported import document: {0}")]
    BadImport(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileBundle {
    pub format: String,
    pub version: u32,
    pub profiles: Vec<FanProfile>,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportOutcome {
    pub imported: usize,
    pub skipped: usize,
    pub renamed: usize,
    pub overwritten: usize,
}

pub struct ProfileStore {
    profiles: RwLock<HashMap<String, FanProfile>>,
}

impl ProfileStore {
    /// Seed the store with the read-only defaults library.
    pub fn with_builtins() -> Self {
        let mut profiles = HashMap::new();
        for profile in builtin_profiles() {
            profiles.insert(profile.id.clone(), profile);
        }
        Self {
            profiles: RwLock::new(profiles),
        }
    }

    pub async fn list(&self) -> Vec<FanProfile> {
        let mut profiles: Vec<FanProfile> = self.profiles.read().await.values().cloned().collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    pub async fn get(&self, id: &str) -> Option<FanProfile> {
        self.profiles.read().await.get(id).cloned()
    }

    pub async fn create(
        &self,
        name: String,
        profile_type: String,
        mut points: Vec<CurvePoint>,
    ) -> Result<FanProfile, ProfileError> {
        pankha_protocol::curves::validate_points(&points)?;
        normalize_points(&mut points);
        let profile = FanProfile {
            id: Uuid::new_v4().to_string(),
            name,
            profile_type,
            points,
            global: false,
            system: false,
        };
        self.profiles
            .write()
            .await
            .insert(profile.id.clone(), profile.clone());
        Ok(profile)
    }

    /// Copy-on-edit: editing any profile yields a replacement with a new
    /// id; editing a built-in leaves the original untouched.
    pub async fn update(
        &self,
        id: &str,
        name: Option<String>,
        mut points: Vec<CurvePoint>,
    ) -> Result<FanProfile, ProfileError> {
        pankha_protocol::curves::validate_points(&points)?;
        normalize_points(&mut points);

        let mut profiles = self.profiles.write().await;
        let existing = profiles
            .get(id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;

        let replacement = FanProfile {
            id: Uuid::new_v4().to_string(),
            name: name.unwrap_or_else(|| {
                if existing.system {
                    format!("{} (copy)", existing.name)
                } else {
                    existing.name.clone()
                }
            }),
            profile_type: existing.profile_type.clone(),
            points,
            global: existing.global,
            system: false,
        };

        if !existing.system {
            profiles.remove(id);
        }
        profiles.insert(replacement.id.clone(), replacement.clone());
        Ok(replacement)
    }

    pub async fn delete(&self, id: &str) -> Result<(), ProfileError> {
        let mut profiles = self.profiles.write().await;
        match profiles.get(id) {
            None => Err(ProfileError::NotFound(id.to_string())),
            Some(profile) if profile.system => Err(ProfileError::SystemReadOnly),
            Some(_) => {
                profiles.remove(id);
                Ok(())
            }
        }
    }

    pub async fn export(&self) -> ProfileBundle {
        // Built-ins travel too; the importing side's conflict policy decides
        let profiles = self.list().await;
        ProfileBundle {
            format: EXPORT_FORMAT.to_string(),
            version: EXPORT_SCHEMA_VERSION,
            profiles,
        }
    }

    /// Import a bundle. Conflicts are matched by profile name.
    pub async fn import(
        &self,
        bundle: ProfileBundle,
        policy: ConflictPolicy,
    ) -> Result<ImportOutcome, ProfileError> {
        if bundle.format != EXPORT_FORMAT {
            return Err(ProfileError::BadImport(format!(
                "unknown format tag: {}",
                bundle.format
            )));
        }
        if bundle.version > EXPORT_SCHEMA_VERSION {
            return Err(ProfileError::BadImport(format!(
                "schema version {} is newer than supported {}",
                bundle.version, EXPORT_SCHEMA_VERSION
            )));
        }

        let mut outcome = ImportOutcome::default();
        let mut profiles = self.profiles.write().await;

        for mut incoming in bundle.profiles {
            pankha_protocol::curves::validate_points(&incoming.points)?;
            normalize_points(&mut incoming.points);
            // Imported copies are always user profiles
            incoming.system = false;

            let existing_id = profiles
                .values()
                .find(|p| p.name == incoming.name)
                .map(|p| p.id.clone());

            match (existing_id, policy) {
                (Some(_), ConflictPolicy::Skip) => {
                    outcome.skipped += 1;
                }
                (Some(id), ConflictPolicy::Overwrite) => {
                    let was_system = profiles.get(&id).map(|p| p.system).unwrap_or(false);
                    if was_system {
                        // Built-ins survive; the import lands beside them
                        incoming.id = Uuid::new_v4().to_string();
                        incoming.name = format!("{} (imported)", incoming.name);
                        profiles.insert(incoming.id.clone(), incoming);
                        outcome.renamed += 1;
                    } else {
                        profiles.remove(&id);
                        incoming.id = Uuid::new_v4().to_string();
                        profiles.insert(incoming.id.clone(), incoming);
                        outcome.overwritten += 1;
                    }
                }
                (Some(_), ConflictPolicy::Rename) => {
                    incoming.id = Uuid::new_v4().to_string();
                    let base = incoming.name.clone();
                    let mut n = 2;
                    while profiles.values().any(|p| p.name == incoming.name) {
                        incoming.name = format!("{} ({})", base, n);
                        n += 1;
                    }
                    profiles.insert(incoming.id.clone(), incoming);
                    outcome.renamed += 1;
                }
                (None, _) => {
                    incoming.id = Uuid::new_v4().to_string();
                    profiles.insert(incoming.id.clone(), incoming);
                    outcome.imported += 1;
                }
            }
        }

        info!(
            "Profile import: {} new, {} skipped, {} renamed, {} overwritten",
            outcome.imported, outcome.skipped, outcome.renamed, outcome.overwritten
        );
        Ok(outcome)
    }
}

fn curve(points: &[(f64, u8)]) -> Vec<CurvePoint> {
    points
        .iter()
        .map(|&(temperature, duty)| CurvePoint { temperature, duty })
        .collect()
}

/// The defaults library. Ids are stable so fan bindings survive restarts.
fn builtin_profiles() -> Vec<FanProfile> {
    let defs: Vec<(&str, &str, &str, Vec<CurvePoint>)> = vec![
        (
            "builtin-silent",
            "Silent",
            "case",
            curve(&[(30.0, 0), (45.0, 20), (60.0, 35), (75.0, 60), (85.0, 100)]),
        ),
        (
            "builtin-balanced",
            "Balanced",
            "case",
            curve(&[(30.0, 20), (50.0, 40), (65.0, 70), (80.0, 100)]),
        ),
        (
            "builtin-performance",
            "Performance",
            "cpu",
            curve(&[(30.0, 35), (45.0, 55), (60.0, 80), (75.0, 100)]),
        ),
        (
            "builtin-gpu-optimal",
            "GPU-Optimal",
            "gpu",
            curve(&[(35.0, 0), (50.0, 30), (65.0, 55), (78.0, 85), (85.0, 100)]),
        ),
        (
            "builtin-lazy",
            "Lazy",
            "case",
            curve(&[(40.0, 10), (65.0, 30), (85.0, 100)]),
        ),
        (
            "builtin-standard",
            "Standard",
            "case",
            curve(&[(30.0, 25), (50.0, 45), (70.0, 75), (85.0, 100)]),
        ),
        (
            "builtin-small-board",
            "Small Board",
            "sbc",
            curve(&[(40.0, 0), (55.0, 40), (70.0, 100)]),
        ),
    ];

    defs.into_iter()
        .map(|(id, name, profile_type, points)| FanProfile {
            id: id.to_string(),
            name: name.to_string(),
            profile_type: profile_type.to_string(),
            points,
            global: true,
            system: true,
        })
        .collect()
}

/// JSON body for `GET /api/profiles`.
pub fn profiles_response(profiles: &[FanProfile]) -> serde_json::Value {
    json!({ "profiles": profiles })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builtins_are_seeded_and_read_only() {
        let store = ProfileStore::with_builtins();
        let profiles = store.list().await;
        assert_eq!(profiles.len(), 7);
        assert!(profiles.iter().all(|p| p.system));
        for p in &profiles {
            assert!(p.validate().is_ok(), "builtin {} is invalid", p.name);
        }

        let silent = profiles.iter().find(|p| p.name == "Silent").unwrap();
        assert!(matches!(
            store.delete(&silent.id).await,
            Err(ProfileError::SystemReadOnly)
        ));
    }

    #[tokio::test]
    async fn editing_builtin_clones_to_new_id() {
        let store = ProfileStore::with_builtins();
        let before = store.list().await.len();

        let edited = store
            .update(
                "builtin-silent",
                None,
                vec![
                    CurvePoint { temperature: 30.0, duty: 5 },
                    CurvePoint { temperature: 80.0, duty: 100 },
                ],
            )
            .await
            .unwrap();

        assert_ne!(edited.id, "builtin-silent");
        assert!(!edited.system);
        assert_eq!(edited.name, "Silent (copy)");
        // Original still present
        assert!(store.get("builtin-silent").await.is_some());
        assert_eq!(store.list().await.len(), before + 1);
    }

    #[tokio::test]
    async fn create_rejects_invalid_curves() {
        let store = ProfileStore::with_builtins();
        let result = store
            .create(
                "Broken".into(),
                "case".into(),
                vec![CurvePoint { temperature: 30.0, duty: 20 }],
            )
            .await;
        assert!(matches!(result, Err(ProfileError::InvalidCurve(_))));
    }

    #[tokio::test]
    async fn reimport_with_skip_is_a_noop() {
        let store = ProfileStore::with_builtins();
        store
            .create(
                "Custom".into(),
                "case".into(),
                curve(&[(30.0, 10), (80.0, 90)]),
            )
            .await
            .unwrap();

        let bundle = store.export().await;
        let count_before = store.list().await.len();

        let outcome = store.import(bundle, ConflictPolicy::Skip).await.unwrap();
        assert_eq!(outcome.imported, 0);
        assert_eq!(outcome.skipped, count_before);
        assert_eq!(store.list().await.len(), count_before);
    }

    #[tokio::test]
    async fn import_rename_keeps_both_copies() {
        let store = ProfileStore::with_builtins();
        store
            .create(
                "Custom".into(),
                "case".into(),
                curve(&[(30.0, 10), (80.0, 90)]),
            )
            .await
            .unwrap();

        let bundle = ProfileBundle {
            format: EXPORT_FORMAT.into(),
            version: 1,
            profiles: vec![FanProfile {
                id: "whatever".into(),
                name: "Custom".into(),
                profile_type: "case".into(),
                points: curve(&[(20.0, 5), (70.0, 80)]),
                global: false,
                system: false,
            }],
        };

        let outcome = store.import(bundle, ConflictPolicy::Rename).await.unwrap();
        assert_eq!(outcome.renamed, 1);
        let names: Vec<String> = store.list().await.into_iter().map(|p| p.name).collect();
        assert!(names.contains(&"Custom".to_string()));
        assert!(names.contains(&"Custom (2)".to_string()));
    }

    #[tokio::test]
    async fn import_rejects_foreign_format() {
        let store = ProfileStore::with_builtins();
        let bundle = ProfileBundle {
            format: "other-tool".into(),
            version: 1,
            profiles: vec![],
        };
        assert!(matches!(
            store.import(bundle, ConflictPolicy::Skip).await,
            Err(ProfileError::BadImport(_))
        ));
    }
}
