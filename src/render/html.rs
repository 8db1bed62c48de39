use crate::cache::followup::{IndexRow, SummaryTable, stat_label};
use crate::pp::PpSummary;
use crate::render::WorkflowReport;

/// Escape text for an HTML element or attribute.
pub fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Render a self-contained workflow report (data embedded as JSON).
///
/// Important: we avoid `format!()` because the HTML contains many `{}` from JS
/// template literals (e.g., `${x}`), which would conflict with Rust formatting.
pub fn render_workflow_report(data: &WorkflowReport) -> anyhow::Result<String> {
    let json = serde_json::to_string(data)?; // embedded as JS object literal

    const TEMPLATE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Post-processing workflow</title>
<style>
  body { font-family: system-ui, -apple-system, Segoe UI, Roboto, Arial, sans-serif; margin: 0; }
  header { padding: 12px 16px; border-bottom: 1px solid #ddd; }
  .container { display: flex; height: calc(100vh - 58px); }
  .sidebar { width: 420px; border-right: 1px solid #ddd; padding: 12px; overflow: auto; }
  .main { flex: 1; padding: 12px; overflow: auto; }

  .summary { display: flex; gap: 16px; flex-wrap: wrap; font-size: 14px; color: #333; }
  .pill { padding: 4px 8px; border: 1px solid #ddd; border-radius: 999px; background: #fafafa; }

  .tree-node { cursor: pointer; user-select: none; padding: 2px 4px; border-radius: 4px; }
  .tree-node:hover { background: #f3f3f3; }
  .tree-node.selected { background: #e9f2ff; border: 1px solid #cfe3ff; }
  .indent { display: inline-block; width: 16px; }
  .toggle { display: inline-block; width: 16px; text-align: center; color: #666; }
  .muted { color: #777; font-size: 12px; }

  table { border-collapse: collapse; width: 100%; margin-top: 8px; }
  th, td { border-bottom: 1px solid #eee; padding: 6px 8px; text-align: left; font-size: 14px; }
  th { position: sticky; top: 0; background: white; border-bottom: 1px solid #ddd; }
  code { font-family: ui-monospace, SFMono-Regular, Menlo, Consolas, monospace; font-size: 13px; }
  pre { white-space: pre-wrap; word-break: break-all; background: #fafafa; padding: 8px; border: 1px solid #eee; }
</style>
</head>
<body>
<header>
  <div class="summary" id="summary"></div>
</header>

<div class="container">
  <div class="sidebar">
    <div style="display:flex; gap: 8px; margin-bottom: 8px;">
      <input id="search" placeholder="Search job or tag..." style="flex:1; padding: 6px 8px; border: 1px solid #ddd; border-radius: 6px;">
      <button id="expandAll" style="padding: 6px 10px;">Expand</button>
      <button id="collapseAll" style="padding: 6px 10px;">Collapse</button>
    </div>
    <div id="tree"></div>
  </div>

  <div class="main">
    <h2 id="title">Select a job</h2>
    <div id="meta" class="muted"></div>
    <pre id="command" style="display:none;"></pre>

    <table id="filesTable" style="display:none;">
      <thead>
        <tr>
          <th>direction</th>
          <th>file</th>
        </tr>
      </thead>
      <tbody id="filesBody"></tbody>
    </table>

    <h3>Stage outputs</h3>
    <table>
      <thead>
        <tr>
          <th>file</th>
          <th>tags</th>
        </tr>
      </thead>
      <tbody id="outputsBody"></tbody>
    </table>
  </div>
</div>

<script>
// Embedded report data (JSON object literal)
const DATA = __DATA__;

const state = {
  expanded: new Set(),
  selected: null,
  search: ""
};

function escapeHtml(s) {
  return String(s)
    .replaceAll("&", "&amp;")
    .replaceAll("<", "&lt;")
    .replaceAll(">", "&gt;")
    .replaceAll('"', "&quot;")
    .replaceAll("'", "&#39;");
}

function renderSummary() {
  const t = DATA.totals;
  const el = document.getElementById("summary");
  el.innerHTML = `
    <span class="pill"><b>${escapeHtml(DATA.title)}</b></span>
    <span class="pill">jobs: <b>${t.nodes}</b></span>
    <span class="pill">dependencies: <b>${t.edges}</b></span>
    <span class="pill">output files: <b>${t.files}</b></span>
  `;
}

function nodeMatches(node) {
  if (!state.search) return true;
  return node.label.toLowerCase().includes(state.search.toLowerCase());
}

function renderTree() {
  const root = document.getElementById("tree");
  root.innerHTML = "";

  // With a search, show matches and every ancestor on some path to them.
  const mustShow = new Set();
  if (state.search) {
    const stack = [];
    for (const [name, node] of Object.entries(DATA.nodes)) {
      if (nodeMatches(node)) stack.push(name);
    }
    while (stack.length) {
      const cur = stack.pop();
      if (mustShow.has(cur)) continue;
      mustShow.add(cur);
      for (const p of DATA.nodes[cur].parents) stack.push(p);
    }
  }

  function renderSubtree(name, depth) {
    const node = DATA.nodes[name];
    if (!node) return;

    if (state.search && !mustShow.has(name)) return;

    const isExpanded = state.expanded.has(name);
    const hasKids = node.children.length > 0;

    const row = document.createElement("div");
    row.className = "tree-node" + (state.selected === name ? " selected" : "");
    row.onclick = () => selectNode(name);

    const indent = document.createElement("span");
    indent.className = "indent";
    indent.style.width = (depth * 16) + "px";
    row.appendChild(indent);

    const toggle = document.createElement("span");
    toggle.className = "toggle";
    toggle.textContent = hasKids ? (isExpanded ? "▾" : "▸") : " ";
    toggle.onclick = (e) => {
      e.stopPropagation();
      if (!hasKids) return;
      if (isExpanded) state.expanded.delete(name);
      else state.expanded.add(name);
      renderTree();
    };
    row.appendChild(toggle);

    const label = document.createElement("span");
    label.innerHTML = `${escapeHtml(node.label)} <span class="muted">${name}</span>`;
    row.appendChild(label);

    root.appendChild(row);

    if (hasKids && isExpanded) {
      for (const c of node.children) renderSubtree(c, depth + 1);
    }
  }

  for (const r of DATA.roots) renderSubtree(r, 0);
}

function selectNode(name) {
  state.selected = name;
  const node = DATA.nodes[name];
  document.getElementById("title").textContent = node.label;
  document.getElementById("meta").textContent =
    `${name} | job: ${node.job} | parents: ${node.parents.length ? node.parents.join(", ") : "none"}`;

  const cmd = document.getElementById("command");
  cmd.style.display = "block";
  cmd.textContent = [node.executable].concat(node.args).join(" ");

  const tbl = document.getElementById("filesTable");
  const body = document.getElementById("filesBody");
  body.innerHTML = "";
  const rows = node.inputs.map(f => ["in", f]).concat(node.outputs.map(f => ["out", f]));
  tbl.style.display = rows.length ? "table" : "none";
  for (const [dir, f] of rows) {
    const tr = document.createElement("tr");
    tr.innerHTML = `<td>${dir}</td><td><code>${escapeHtml(f)}</code></td>`;
    body.appendChild(tr);
  }

  renderTree();
}

function renderOutputs() {
  const body = document.getElementById("outputsBody");
  for (const f of DATA.files) {
    const tr = document.createElement("tr");
    tr.innerHTML = `<td><code title="${escapeHtml(f.path)}">${escapeHtml(f.name)}</code></td><td>${escapeHtml(f.tags)}</td>`;
    body.appendChild(tr);
  }
}

function expandAll() {
  for (const name of Object.keys(DATA.nodes)) {
    if (DATA.nodes[name].children.length) state.expanded.add(name);
  }
  renderTree();
}

function collapseAll() {
  state.expanded.clear();
  renderTree();
}

document.getElementById("search").addEventListener("input", (e) => {
  state.search = e.target.value || "";
  renderTree();
});

document.getElementById("expandAll").onclick = expandAll;
document.getElementById("collapseAll").onclick = collapseAll;

renderSummary();
renderOutputs();
for (const r of DATA.roots) state.expanded.add(r);
renderTree();
if (DATA.roots.length) selectNode(DATA.roots[0]);
</script>
</body>
</html>
"#;

    Ok(TEMPLATE.replace("__DATA__", &json))
}

/// One candidate's summary page: a row per follow-up module.
pub fn render_summary_table(table: &SummaryTable) -> String {
    const TEMPLATE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Follow Up Report</title>
</head>
<body>
<h3>Trigger [__ID__] with combined statistic = __STAT__</h3>
<table width="800" border="1">
__ROWS__
</table>
</body>
</html>
"#;

    let mut rows = String::new();
    for c in &table.containers {
        rows.push_str(&format!(
            "<tr><td width=\"400\"><b>{}</b><br><a href=\"{}\">{}</a></td>\
             <td><a href=\"{}\"><img src=\"{}\" width=\"400\" alt=\"No Image\"></a></td></tr>\n",
            escape(&c.name),
            escape(&c.link),
            escape(&c.text),
            escape(&c.image),
            escape(&c.image),
        ));
    }

    TEMPLATE
        .replace("__ID__", &escape(&table.trig.event_id))
        .replace("__STAT__", &table.trig.stat.to_string())
        .replace("__ROWS__", &rows)
}

/// Index of every summary page, found injections first.
pub fn render_followup_index(page: &str, found: &[IndexRow], trigs: &[IndexRow]) -> String {
    const TEMPLATE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Follow Up Index</title>
</head>
<body>
__SECTIONS__
</body>
</html>
"#;

    let mut sections = String::new();
    for (title, dir, rows) in [
        ("Found Injection follow ups", "followupfound", found),
        ("Found Trigger follow ups", "followuptrigs", trigs),
    ] {
        if rows.is_empty() {
            continue;
        }
        sections.push_str(&format!("<h3>{}</h3>\n<table>\n<tr><th>Stat Value</th><th>ID</th></tr>\n", title));
        for r in rows {
            let stat = stat_label(r.stat);
            let href = format!("{}/{}/{}_{}_summary.html", page, dir, stat, r.event_id);
            sections.push_str(&format!(
                "<tr><td>{}</td><td><a href=\"{}\">{}</a></td></tr>\n",
                stat,
                escape(&href),
                escape(&r.event_id)
            ));
        }
        sections.push_str("</table>\n<br>\n");
    }

    TEMPLATE.replace("__SECTIONS__", &sections)
}

/// P-P summary: a static table of K-S p-values plus curves drawn from the
/// embedded data.
pub fn render_pp_index(summary: &PpSummary) -> anyhow::Result<String> {
    let json = serde_json::to_string(summary)?;

    const TEMPLATE: &str = r##"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>P-P Plots</title>
<style>
  body { font-family: system-ui, -apple-system, Segoe UI, Roboto, Arial, sans-serif; margin: 16px; }
  table { border-collapse: collapse; }
  th, td { border: 1px solid #ddd; padding: 6px 8px; font-size: 14px; }
  .num { text-align: right; font-variant-numeric: tabular-nums; }
  svg { background: white; }
</style>
</head>
<body>
<p>This page was generated with the output of __COUNT__ simulations.</p>
__LINKS__
<table>
<tr><th>Parameter</th><th>K-S p-value</th><th>p-p plot</th><th>Links</th></tr>
__ROWS__
</table>

<script>
const DATA = __DATA__;

function drawCurve(svg, pts, color, dash) {
  const size = 300;
  const poly = document.createElementNS("http://www.w3.org/2000/svg", "polyline");
  poly.setAttribute("points", pts.map(([x, y]) => `${x * size},${size - y * size}`).join(" "));
  poly.setAttribute("fill", "none");
  poly.setAttribute("stroke", color);
  if (dash) poly.setAttribute("stroke-dasharray", "4 3");
  svg.appendChild(poly);
}

for (const r of DATA.results) {
  const svg = document.getElementById("plot-" + r.name);
  if (!svg) continue;
  for (const s of r.synthetic) drawCurve(svg, s, "#e6e6e6", false);
  drawCurve(svg, [[0, 0], [1, 1]], "black", true);
  drawCurve(svg, r.curve, "black", false);
}
</script>
</body>
</html>
"##;

    let mut links = String::new();
    if !summary.links.is_empty() {
        links.push_str("<ul>\n");
        for (href, text) in &summary.links {
            links.push_str(&format!("<li><a href=\"{}\">{}</a></li>\n", escape(href), escape(text)));
        }
        links.push_str("</ul>\n");
    }

    let mut rows = String::new();
    for r in &summary.results {
        let name = escape(&r.name);
        rows.push_str(&format!(
            "<tr><td>{}</td><td class=\"num\">{:.4}</td>\
             <td><svg id=\"plot-{}\" width=\"300\" height=\"300\" viewBox=\"0 0 300 300\"></svg></td>\
             <td><a href=\"{}-ps.dat\">p-values</a></td></tr>\n",
            escape(&r.latex),
            r.ks_pvalue,
            name,
            name
        ));
    }

    Ok(TEMPLATE
        .replace("__COUNT__", &summary.injections.to_string())
        .replace("__LINKS__", &links)
        .replace("__ROWS__", &rows)
        .replace("__DATA__", &json))
}
