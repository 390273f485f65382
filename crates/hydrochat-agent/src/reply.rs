//! Response templates. These strings are part of the external contract —
//! clients and tests match on them — so composition lives here, in one
//! place, and stays free of ad-hoc formatting at call sites.

use std::collections::BTreeSet;

use hydrochat_core::types::{DisambiguationOption, Patient, ScanResult};

pub fn create_success(patient: &Patient) -> String {
    let mut line = format!(
        "Created patient #{}: {} (NRIC {}).",
        patient.id,
        patient.display_name(),
        patient.masked_nric()
    );
    if let Some(dob) = &patient.date_of_birth {
        line.push_str(&format!(" DOB {dob}."));
    }
    if let Some(contact) = &patient.contact_no {
        line.push_str(&format!(" Contact {contact}."));
    }
    if let Some(details) = &patient.details {
        line.push_str(&format!(" Details: {details}."));
    }
    line
}

pub fn update_success(id: i64, changed_fields: &[&str]) -> String {
    format!("Updated patient #{id}: changed {}.", changed_fields.join(", "))
}

pub fn delete_success(id: i64, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("Deleted patient #{id} ({name})."),
        None => format!("Deleted patient #{id}."),
    }
}

pub fn confirm_delete(id: i64, name: Option<&str>) -> String {
    match name {
        Some(name) => {
            format!("Please confirm deletion of patient ID {id} ({name}) \u{2013} yes or no?")
        }
        None => format!("Please confirm deletion of patient ID {id} \u{2013} yes or no?"),
    }
}

pub fn need_fields(missing: &BTreeSet<String>) -> String {
    let list = missing.iter().cloned().collect::<Vec<_>>().join(", ");
    format!("Need {list}. Please provide.")
}

pub fn cancelled() -> String {
    "Action cancelled. What would you like to do next?".to_string()
}

pub fn disambiguation_list(query: &str, options: &[DisambiguationOption]) -> String {
    let mut lines = vec![format!(
        "Multiple patients match '{query}'. Reply with the patient id:"
    )];
    for (index, option) in options.iter().enumerate() {
        lines.push(format!(
            "{}. Patient #{}: {} (NRIC {})",
            index + 1,
            option.id,
            option.display_name,
            option.masked_nric
        ));
    }
    lines.join("\n")
}

pub fn patient_details(patient: &Patient) -> String {
    let mut lines = vec![format!(
        "Patient #{}: {} (NRIC {})",
        patient.id,
        patient.display_name(),
        patient.masked_nric()
    )];
    if let Some(dob) = &patient.date_of_birth {
        lines.push(format!("DOB: {dob}"));
    }
    if let Some(contact) = &patient.contact_no {
        lines.push(format!("Contact: {contact}"));
    }
    if let Some(details) = &patient.details {
        lines.push(format!("Details: {details}"));
    }
    lines.join("\n")
}

pub fn patient_list(patients: &[Patient]) -> String {
    if patients.is_empty() {
        return "No patients on record.".to_string();
    }
    let mut lines = vec![format!("Patients ({}):", patients.len())];
    for patient in patients {
        lines.push(format!(
            "- #{} {} (NRIC {})",
            patient.id,
            patient.display_name(),
            patient.masked_nric()
        ));
    }
    lines.join("\n")
}

pub fn scan_header(patient_id: i64) -> String {
    format!("Scan Results for Patient #{patient_id}")
}

pub fn scan_preview_line(scan: &ScanResult) -> String {
    let volume = scan
        .volume_estimate
        .map(|v| v.to_string())
        .unwrap_or_else(|| "\u{2014}".to_string());
    let stl = if scan.stl_file.is_some() { "Yes" } else { "No" };
    format!(
        "- Scan {} | Date {} | Volume {} | STL {}",
        scan.id,
        scan.created_date(),
        volume,
        stl
    )
}

pub fn scan_showing_line(shown: usize, total: usize) -> String {
    format!("Showing {shown} of {total}. Say 'show more scans' to see the next page.")
}

pub fn stl_question() -> String {
    "Would you like STL download links for the scans shown? (yes/no)".to_string()
}

pub fn stl_line(scan: &ScanResult) -> String {
    match &scan.stl_file {
        Some(url) => format!("Download STL (Scan {}): {}", scan.id, url),
        None => format!("Scan {}: (No STL available)", scan.id),
    }
}

pub fn no_scans(patient_id: i64) -> String {
    format!("No scans available for patient #{patient_id}.")
}

pub fn unknown_intent() -> String {
    "I can create, update, or delete a patient, list patients, show patient \
     details, or show scan results. What would you like to do?"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient() -> Patient {
        Patient {
            id: 12,
            first_name: "John".into(),
            last_name: "Lee".into(),
            nric: "S1234567A".into(),
            date_of_birth: None,
            contact_no: None,
            details: None,
            user: None,
        }
    }

    #[test]
    fn create_template_masks_nric() {
        let text = create_success(&patient());
        assert_eq!(text, "Created patient #12: John Lee (NRIC S******7A).");
    }

    #[test]
    fn confirm_delete_matches_contract() {
        assert_eq!(
            confirm_delete(12, Some("John Lee")),
            "Please confirm deletion of patient ID 12 (John Lee) \u{2013} yes or no?"
        );
    }

    #[test]
    fn need_fields_renders_sorted_csv() {
        let mut missing = BTreeSet::new();
        missing.insert("nric".to_string());
        assert_eq!(need_fields(&missing), "Need nric. Please provide.");
        missing.insert("last_name".to_string());
        assert_eq!(need_fields(&missing), "Need last_name, nric. Please provide.");
    }

    #[test]
    fn scan_preview_line_renders_dash_for_missing_volume() {
        let scan = ScanResult {
            id: 101,
            patient: 5,
            created_at: "2026-07-14T09:30:00Z".into(),
            volume_estimate: None,
            preview_image: Some("http://backend.local/p/101.png".into()),
            stl_file: None,
        };
        assert_eq!(
            scan_preview_line(&scan),
            "- Scan 101 | Date 2026-07-14 | Volume \u{2014} | STL No"
        );
    }

    #[test]
    fn stl_lines_cover_both_cases() {
        let mut scan = ScanResult {
            id: 101,
            patient: 5,
            created_at: "2026-07-14T09:30:00Z".into(),
            volume_estimate: Some(12.5),
            preview_image: None,
            stl_file: Some("http://backend.local/stl/101.stl".into()),
        };
        assert_eq!(
            stl_line(&scan),
            "Download STL (Scan 101): http://backend.local/stl/101.stl"
        );
        scan.stl_file = None;
        assert_eq!(stl_line(&scan), "Scan 101: (No STL available)");
    }
}
