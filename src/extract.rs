use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::models::{ExperienceEntry, PartialSnapshot};

const NAME_SELECTORS: &[&str] = &[
    "h1.text-heading-xlarge",
    ".pv-text-details__left-panel h1",
    "h1",
];

const HEADLINE_SELECTORS: &[&str] = &[
    "div.text-body-medium.break-words",
    ".pv-text-details__left-panel .text-body-medium",
    ".pv-about__summary-text",
];

// Tried in order; the first strategy that yields candidates wins.
const EXPERIENCE_STRATEGIES: &[&str] = &[
    "section[data-section='experience'] li.artdeco-list__item",
    "#experience ~ div li.artdeco-list__item",
    "div#experience div.pv-entity__summary-info",
    "div.pvs-entity__sub-components, div.pv-profile-section__card-item",
];

const MAX_EXPERIENCE: usize = 10;

const ACTIVITY_WORDS: &[&str] = &["posted", "shared", "liked", "commented"];

const NOISE_MARKERS: &[&str] = &[
    "posted", "shared a post", "liked this", "commented on this", "reacted to",
    "follow", "connect", "endorse", "recommend", "see all activity", "recent activity",
    "free insight", "unlock", "sales navigator", "improve outreach", "premium",
    "upgrade", "try premium", "see more", "view all", "load more",
];

const TITLE_WORDS: &[&str] = &[
    "president", "manager", "director", "engineer", "developer", "analyst",
    "consultant", "specialist", "coordinator", "assistant", "executive", "officer",
    "representative", "associate", "senior", "junior", "lead", "head", "chief", "vice",
    "intern", "trainee", "member", "chair", "founder", "partner", "owner", "scientist",
    "designer", "architect", "sales", "marketing", "product", "software", "data",
    "business", "operations", "finance", "human resources", "recruit",
];

const COMPANY_WORDS: &[&str] = &[
    "ltd", "limited", "inc", "corp", "corporation", "llc", "llp", "pvt", "private",
    "university", "college", "school", "institute", "academy", "group", "solutions",
    "systems", "technologies", "services", "enterprises", "industries", "international",
    "global", "company", "labs", "gmbh",
];

const EDUCATION_WORDS: &[&str] = &[
    "school", "university", "college", "bachelor", "master", "phd", "degree",
];

static DATE_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b\d+\s*(yrs?|mos?|years?|months?)\b|\bpresent\b|\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+(19|20)\d{2}\b|^\s*(19|20)\d{2}\s*(-|–|$)",
    )
    .expect("date pattern is valid")
});

/// Parse a rendered profile page. Total: never fails, unknown fields stay `None`.
pub fn extract(raw: &str) -> PartialSnapshot {
    if raw.trim().is_empty() {
        return PartialSnapshot::default();
    }
    let document = Html::parse_document(raw);

    let name = first_match(&document, NAME_SELECTORS, 3);
    let headline = first_match(&document, HEADLINE_SELECTORS, 5);
    let experience = extract_experience(&document);

    let (position, company) = match experience.first() {
        Some(current) => (Some(current.title.clone()), Some(current.company.clone())),
        None => {
            warn!("no experience entries found, markup may have drifted");
            (None, None)
        }
    };

    if name.is_none() {
        warn!("could not locate profile name");
    }
    if headline.is_none() {
        debug!("could not locate profile headline");
    }

    PartialSnapshot {
        name,
        headline,
        position,
        company,
        experience,
    }
}

fn first_match(document: &Html, selectors: &[&str], min_len: usize) -> Option<String> {
    for raw_selector in selectors {
        let Ok(selector) = Selector::parse(raw_selector) else {
            continue;
        };
        for element in document.select(&selector) {
            let text = element_text(element);
            let lower = text.to_lowercase();
            if text.chars().count() > min_len && !ACTIVITY_WORDS.iter().any(|w| lower.contains(w)) {
                return Some(text);
            }
        }
    }
    None
}

fn extract_experience(document: &Html) -> Vec<ExperienceEntry> {
    let mut candidates = Vec::new();
    for (i, raw_selector) in EXPERIENCE_STRATEGIES.iter().enumerate() {
        let Ok(selector) = Selector::parse(raw_selector) else {
            continue;
        };
        candidates = document
            .select(&selector)
            .filter(|item| is_experience_candidate(&element_text(*item)))
            .collect::<Vec<_>>();
        if !candidates.is_empty() {
            debug!(strategy = i + 1, items = candidates.len(), "experience items located");
            break;
        }
    }

    let mut entries = Vec::new();
    for item in candidates {
        if entries.len() >= MAX_EXPERIENCE {
            break;
        }
        entries.extend(parse_experience_item(item));
    }
    entries.truncate(MAX_EXPERIENCE);
    entries
}

fn is_experience_candidate(text: &str) -> bool {
    let lower = text.to_lowercase();
    if lower.len() < 10 {
        return false;
    }
    if NOISE_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    if lower.len() < 20 && DATE_LIKE.is_match(&lower) {
        return false;
    }
    let has_title = TITLE_WORDS.iter().any(|w| lower.contains(w));
    let has_company = COMPANY_WORDS.iter().any(|w| lower.contains(w));
    let education_only = EDUCATION_WORDS.iter().any(|w| lower.contains(w)) && !has_title;
    (has_title || has_company) && !education_only
}

/// A grouped entry lists one company with several nested roles; the newest role is first.
fn parse_experience_item(item: ElementRef) -> Vec<ExperienceEntry> {
    let span = Selector::parse("span[aria-hidden='true']").ok();
    let nested = Selector::parse("ul li").ok();
    let (Some(span), Some(nested)) = (span, nested) else {
        return Vec::new();
    };

    let spans: Vec<String> = item
        .select(&span)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect();
    if spans.len() < 2 {
        debug!("experience item has fewer than two labelled spans");
        return Vec::new();
    }

    if DATE_LIKE.is_match(&spans[1]) {
        let roles: Vec<String> = item
            .select(&nested)
            .filter_map(|li| li.select(&span).map(element_text).find(|t| !t.is_empty()))
            .filter(|title| !DATE_LIKE.is_match(title) && *title != spans[0])
            .collect();
        if !roles.is_empty() {
            let company = clean_company(&spans[0]);
            return match company {
                Some(company) => roles
                    .into_iter()
                    .map(|title| ExperienceEntry {
                        title,
                        company: company.clone(),
                    })
                    .collect(),
                None => Vec::new(),
            };
        }
    }

    match clean_company(&spans[1]) {
        Some(company) if !DATE_LIKE.is_match(&company) => vec![ExperienceEntry {
            title: spans[0].clone(),
            company,
        }],
        _ => Vec::new(),
    }
}

/// Drops an employment-type suffix such as " · Full-time".
fn clean_company(raw: &str) -> Option<String> {
    let head = raw.split('·').next().unwrap_or(raw).trim();
    if head.is_empty() {
        None
    } else {
        Some(head.to_string())
    }
}

fn element_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
