/// Self-contained HTML report generator.
///
/// Produces a single .html document with embedded CSS, no scripts and no
/// external assets. Output is a pure function of the `Report`.

use crate::core::result_aggregator::Report;
use crate::core::Severity;

pub fn generate_html_report(report: &Report) -> String {
    let high = report.count(Severity::High);
    let medium = report.count(Severity::Medium);
    let low = report.count(Severity::Low);
    let info = report.count(Severity::Info);

    let mut rows = String::new();
    for (i, obs) in report.observations.iter().enumerate() {
        let sev_class = match obs.severity {
            Severity::High => "sev-high",
            Severity::Medium => "sev-medium",
            Severity::Low => "sev-low",
            Severity::Info => "sev-info",
        };
        let endpoint = obs
            .endpoint
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".to_string());
        rows.push_str(&format!(
            r#"<tr>
                <td>{}</td>
                <td><span class="{}">{}</span></td>
                <td>{}</td>
                <td>{}</td>
                <td class="mono">{}</td>
                <td class="mono">{}</td>
                <td>{}</td>
            </tr>
"#,
            i + 1,
            sev_class,
            obs.severity,
            obs.source,
            html_escape(&obs.title),
            html_escape(&endpoint),
            html_escape(obs.url.as_deref().unwrap_or("-")),
            html_escape(&obs.description),
        ));
    }
    if rows.is_empty() {
        rows.push_str(r#"<tr><td colspan="7" class="empty">No observations recorded.</td></tr>"#);
    }

    let hosts = if report.hosts_scanned.is_empty() {
        "<li>none reported</li>".to_string()
    } else {
        report
            .hosts_scanned
            .iter()
            .map(|h| format!("<li class=\"mono\">{}</li>", html_escape(h)))
            .collect::<Vec<_>>()
            .join("")
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>zapflow report: {target}</title>
<style>
* {{ margin: 0; padding: 0; box-sizing: border-box; }}
body {{ background: #0a0a0c; color: #e1e1e6; font-family: system-ui, sans-serif; padding: 2rem; }}
h1 {{ font-size: 1.5rem; margin-bottom: 0.5rem; }}
.sub {{ color: #64647a; font-size: 0.8rem; margin-bottom: 2rem; }}
.meta {{ display: grid; grid-template-columns: repeat(auto-fill, minmax(160px, 1fr)); gap: 1rem; margin-bottom: 2rem; }}
.meta-card {{ background: rgba(255,255,255,0.035); border: 1px solid rgba(255,255,255,0.08); border-radius: 12px; padding: 1.25rem; }}
.meta-card .label {{ font-size: 0.7rem; text-transform: uppercase; letter-spacing: 0.08em; color: #64647a; margin-bottom: 0.5rem; }}
.meta-card .value {{ font-size: 1.75rem; font-weight: 700; font-family: monospace; }}
.value.high {{ color: #f43f5e; }}
.value.medium {{ color: #eab308; }}
.value.low {{ color: #38bdf8; }}
.value.info {{ color: #94949e; }}
.panel {{ background: rgba(255,255,255,0.02); border: 1px solid rgba(255,255,255,0.08); border-radius: 12px; overflow: hidden; margin-bottom: 2rem; padding: 1rem; }}
.panel h2 {{ font-size: 0.8rem; text-transform: uppercase; color: #64647a; margin-bottom: 0.75rem; }}
ul {{ list-style: none; }}
table {{ width: 100%; border-collapse: collapse; font-size: 0.85rem; }}
thead th {{ text-align: left; padding: 0.75rem 1rem; border-bottom: 1px solid rgba(255,255,255,0.08); color: #64647a; font-size: 0.7rem; text-transform: uppercase; }}
tbody td {{ padding: 0.75rem 1rem; border-bottom: 1px solid rgba(255,255,255,0.04); vertical-align: top; }}
.mono {{ font-family: monospace; font-size: 0.8rem; }}
.empty {{ color: #64647a; text-align: center; }}
.sev-high, .sev-medium, .sev-low, .sev-info {{ padding: 0.15rem 0.5rem; border-radius: 9999px; font-size: 0.7rem; font-weight: 700; text-transform: uppercase; }}
.sev-high {{ background: rgba(244,63,94,0.1); color: #f43f5e; }}
.sev-medium {{ background: rgba(234,179,8,0.1); color: #eab308; }}
.sev-low {{ background: rgba(56,189,248,0.1); color: #38bdf8; }}
.sev-info {{ background: rgba(148,148,158,0.1); color: #94949e; }}
</style>
</head>
<body>
<h1>zapflow report</h1>
<div class="sub mono">{target} &middot; generated {generated}</div>
<div class="meta">
  <div class="meta-card"><div class="label">Observations</div><div class="value">{total}</div></div>
  <div class="meta-card"><div class="label">High</div><div class="value high">{high}</div></div>
  <div class="meta-card"><div class="label">Medium</div><div class="value medium">{medium}</div></div>
  <div class="meta-card"><div class="label">Low</div><div class="value low">{low}</div></div>
  <div class="meta-card"><div class="label">Info</div><div class="value info">{info}</div></div>
</div>
<div class="panel"><h2>Hosts scanned</h2><ul>{hosts}</ul></div>
<div class="panel">
<table>
<thead><tr><th>#</th><th>Severity</th><th>Source</th><th>Title</th><th>Endpoint</th><th>URL</th><th>Description</th></tr></thead>
<tbody>
{rows}</tbody>
</table>
</div>
</body>
</html>
"#,
        target = html_escape(&report.target),
        generated = report.generated_at.to_rfc3339(),
        total = report.observations.len(),
        high = high,
        medium = medium,
        low = low,
        info = info,
        hosts = hosts,
        rows = rows,
    )
}

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
