use crate::models::{PartialSnapshot, ProfileSnapshot, RolePair};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// First observation of this profile. Seeds state, never notifies.
    NoPriorData,
    Unchanged,
    /// Something changed, but not an employment transition.
    Updated,
    MaterialChange { old: RolePair, new: RolePair },
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::NoPriorData => "no_prior_data",
            Classification::Unchanged => "unchanged",
            Classification::Updated => "updated",
            Classification::MaterialChange { .. } => "material_change",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldDiff {
    Same,
    /// Known before, unknown now. Read as an extraction gap, not a change.
    Degraded,
    /// Unknown before, known now.
    Filled,
    Changed,
}

fn diff(previous: Option<&str>, current: Option<&str>) -> FieldDiff {
    match (previous, current) {
        (None, None) => FieldDiff::Same,
        (Some(_), None) => FieldDiff::Degraded,
        (None, Some(_)) => FieldDiff::Filled,
        (Some(a), Some(b)) if a == b => FieldDiff::Same,
        (Some(_), Some(_)) => FieldDiff::Changed,
    }
}

/// Current values win where known; unknown fields keep what was there before.
pub fn merge_role(previous: &RolePair, current: &RolePair) -> RolePair {
    RolePair {
        position: current.position.clone().or_else(|| previous.position.clone()),
        company: current.company.clone().or_else(|| previous.company.clone()),
    }
}

pub fn classify(previous: Option<&ProfileSnapshot>, current: &PartialSnapshot) -> Classification {
    let Some(previous) = previous else {
        return Classification::NoPriorData;
    };

    let position = diff(previous.current_position.as_deref(), current.position.as_deref());
    let company = diff(previous.current_company.as_deref(), current.company.as_deref());

    if position == FieldDiff::Changed || company == FieldDiff::Changed {
        let old = previous.role();
        let new = merge_role(&old, &current.role());
        return Classification::MaterialChange { old, new };
    }

    let other_fields = [
        diff(previous.display_name.as_deref(), current.name.as_deref()),
        diff(previous.headline.as_deref(), current.headline.as_deref()),
    ];
    let informative = |d: &FieldDiff| matches!(d, FieldDiff::Filled | FieldDiff::Changed);

    if informative(&position) || informative(&company) || other_fields.iter().any(informative) {
        Classification::Updated
    } else {
        Classification::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stored(position: Option<&str>, company: Option<&str>, headline: Option<&str>) -> ProfileSnapshot {
        ProfileSnapshot {
            id: 1,
            url: "https://www.linkedin.com/in/someone/".to_string(),
            display_name: Some("Someone".to_string()),
            headline: headline.map(str::to_string),
            current_position: position.map(str::to_string),
            current_company: company.map(str::to_string),
            last_updated: Utc::now(),
            created_at: Utc::now(),
        }
    }

    fn observed(position: Option<&str>, company: Option<&str>, headline: Option<&str>) -> PartialSnapshot {
        PartialSnapshot {
            name: Some("Someone".to_string()),
            headline: headline.map(str::to_string),
            position: position.map(str::to_string),
            company: company.map(str::to_string),
            experience: Vec::new(),
        }
    }

    #[test]
    fn test_no_previous_is_no_prior_data() {
        for current in [
            observed(Some("Engineer"), Some("A"), None),
            observed(None, None, None),
            PartialSnapshot::default(),
        ] {
            assert_eq!(classify(None, &current), Classification::NoPriorData);
        }
    }

    #[test]
    fn test_identical_is_unchanged() {
        let prev = stored(Some("Engineer"), Some("A"), Some("Builds things"));
        let cur = observed(Some("Engineer"), Some("A"), Some("Builds things"));
        assert_eq!(classify(Some(&prev), &cur), Classification::Unchanged);
    }

    #[test]
    fn test_position_change_is_material() {
        let prev = stored(Some("Engineer"), Some("A"), None);
        let cur = observed(Some("Senior Engineer"), Some("A"), None);
        assert_eq!(
            classify(Some(&prev), &cur),
            Classification::MaterialChange {
                old: RolePair::new(Some("Engineer"), Some("A")),
                new: RolePair::new(Some("Senior Engineer"), Some("A")),
            }
        );
    }

    #[test]
    fn test_company_change_alone_is_material() {
        let prev = stored(Some("Engineer"), Some("A"), None);
        let cur = observed(Some("Engineer"), Some("B"), None);
        assert!(matches!(classify(Some(&prev), &cur), Classification::MaterialChange { .. }));
    }

    #[test]
    fn test_all_null_current_is_never_material() {
        let previous = [
            stored(Some("Engineer"), Some("A"), Some("h")),
            stored(None, Some("A"), None),
            stored(None, None, None),
        ];
        for prev in &previous {
            let cur = observed(None, None, Some("h"));
            let result = classify(Some(prev), &cur);
            assert!(!matches!(result, Classification::MaterialChange { .. }), "{result:?}");
        }
    }

    #[test]
    fn test_degraded_field_is_ignored() {
        let prev = stored(Some("Engineer"), Some("A"), None);
        let cur = observed(None, Some("A"), None);
        assert_eq!(classify(Some(&prev), &cur), Classification::Unchanged);
    }

    #[test]
    fn test_headline_only_is_updated() {
        let prev = stored(Some("Engineer"), Some("A"), Some("Old headline"));
        let cur = observed(Some("Engineer"), Some("A"), Some("New headline"));
        assert_eq!(classify(Some(&prev), &cur), Classification::Updated);
    }

    #[test]
    fn test_first_known_role_is_updated_not_material() {
        let prev = stored(None, None, None);
        let cur = observed(Some("Engineer"), Some("A"), None);
        assert_eq!(classify(Some(&prev), &cur), Classification::Updated);
    }

    #[test]
    fn test_material_change_new_pair_fills_unknown_from_previous() {
        let prev = stored(Some("Engineer"), Some("A"), None);
        let cur = observed(Some("Manager"), None, None);
        assert_eq!(
            classify(Some(&prev), &cur),
            Classification::MaterialChange {
                old: RolePair::new(Some("Engineer"), Some("A")),
                new: RolePair::new(Some("Manager"), Some("A")),
            }
        );
    }

    #[test]
    fn test_merge_role() {
        let prev = RolePair::new(Some("Engineer"), Some("A"));
        assert_eq!(merge_role(&prev, &RolePair::default()), prev);
        assert_eq!(
            merge_role(&prev, &RolePair::new(None, Some("B"))),
            RolePair::new(Some("Engineer"), Some("B"))
        );
    }
}
