//! Static admin page served at `/`.

/// Minimal single-page console: paste a compose document, pick a project
/// name, and watch the streamed tool output.
pub const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>stackd</title></head>
<body>
<h3>stackd</h3>
<label>Project: <input id="project" value="default"/></label><br/>
<textarea id="compose" rows="20" cols="80" placeholder="Paste compose YAML here"></textarea><br/>
<button id="up">Up</button>
<button id="down">Down</button>
<button id="stacks">Stacks</button>
<pre id="out" style="white-space:pre-wrap; border:1px solid #ccc; padding:8px; margin-top:12px; max-height:400px; overflow:auto"></pre>
<script>
var out = document.getElementById('out');

async function streamTo(resp) {
  out.textContent = '';
  var reader = resp.body.getReader();
  var decoder = new TextDecoder();
  for (;;) {
    var chunk = await reader.read();
    if (chunk.done) break;
    out.textContent += decoder.decode(chunk.value, {stream: true});
    out.scrollTop = out.scrollHeight;
  }
}

async function run(method, path) {
  out.textContent = 'Sending...';
  try {
    var resp = await fetch(path, {method: method, body: document.getElementById('compose').value});
    await streamTo(resp);
  } catch (e) {
    out.textContent = 'Error: ' + e;
  }
}

document.getElementById('up').onclick = function() {
  run('PUT', '/stack/' + encodeURIComponent(document.getElementById('project').value));
};
document.getElementById('down').onclick = function() {
  run('POST', '/stack/' + encodeURIComponent(document.getElementById('project').value) + '/down');
};
document.getElementById('stacks').onclick = async function() {
  out.textContent = 'Loading...';
  try {
    var resp = await fetch('/stacks');
    out.textContent = JSON.stringify(await resp.json(), null, 2);
  } catch (e) {
    out.textContent = 'Error: ' + e;
  }
};
</script>
</body>
</html>
"#;
