//! Fills the embedded provisional-certificate template from an assembled
//! transcript. PDF conversion is the embedding application's concern; this
//! module only produces the final HTML document.

use crate::grading::Division;

const TEMPLATE: &str = include_str!("../assets/certificate.html");

#[derive(Debug, Clone)]
pub struct SemesterRow {
    pub semester_title: String,
    pub obtained: i64,
    pub maximum: i64,
}

#[derive(Debug, Clone)]
pub struct CertificateData {
    pub student_name: String,
    pub father_name: String,
    pub registration_number: i64,
    pub branch: String,
    pub session: String,
    pub issue_date: String,
    pub rows: Vec<SemesterRow>,
    pub total_obtained: i64,
    pub total_maximum: i64,
    pub percentage: f64,
    pub division: Division,
}

pub fn render(data: &CertificateData) -> String {
    let mut rows_html = String::new();
    for row in &data.rows {
        rows_html.push_str(&format!(
            "      <tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape(&row.semester_title),
            row.obtained,
            row.maximum
        ));
    }

    TEMPLATE
        .replace("{{STUDENT_NAME}}", &escape(&data.student_name))
        .replace("{{FATHER_NAME}}", &escape(&data.father_name))
        .replace(
            "{{REGISTRATION_NUMBER}}",
            &data.registration_number.to_string(),
        )
        .replace("{{BRANCH}}", &escape(&data.branch))
        .replace("{{SESSION}}", &escape(&data.session))
        .replace("{{SEMESTER_ROWS}}", rows_html.trim_end())
        .replace("{{TOTAL_OBTAINED}}", &data.total_obtained.to_string())
        .replace("{{TOTAL_MAXIMUM}}", &data.total_maximum.to_string())
        .replace("{{PERCENTAGE}}", &format!("{:.2}", data.percentage))
        .replace("{{DIVISION}}", data.division.as_str())
        .replace("{{ISSUE_DATE}}", &escape(&data.issue_date))
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
