//! Embedded UI assets

/// Served when the real UI bundle was not embedded into the binary
///
/// Keeps the dashboard useful from a bare checkout: the page polls the JSON
/// endpoints that are always present.
pub const FALLBACK_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>azd app dashboard</title>
<style>
  body { font-family: ui-monospace, monospace; margin: 2rem; background: #101418; color: #e6e6e6; }
  h1 { font-size: 1.2rem; }
  table { border-collapse: collapse; margin-top: 1rem; }
  td, th { padding: 0.4rem 0.8rem; border-bottom: 1px solid #2a2f36; text-align: left; }
  .healthy { color: #5dd879; }
  .degraded { color: #e8c964; }
  .unhealthy, .error { color: #ef6b6b; }
  .unknown { color: #9aa4af; }
</style>
</head>
<body>
<h1>azd app dashboard</h1>
<p>UI bundle not embedded; showing live registry state.</p>
<table id="services"><thead>
<tr><th>service</th><th>status</th><th>health</th><th>url</th><th>pid</th></tr>
</thead><tbody></tbody></table>
<script>
async function refresh() {
  const res = await fetch('/api/services');
  const services = await res.json();
  const rows = services.map(s =>
    `<tr><td>${s.name}</td><td class="${s.status}">${s.status}</td>` +
    `<td class="${s.health}">${s.health}</td>` +
    `<td>${s.url ? `<a href="${s.url}">${s.url}</a>` : ''}</td>` +
    `<td>${s.pid || ''}</td></tr>`).join('');
  document.querySelector('#services tbody').innerHTML = rows;
}
refresh();
setInterval(refresh, 2000);
</script>
</body>
</html>
"#;
