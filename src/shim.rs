//! Guest-side bootstrap
//!
//! Evaluated in every fresh interpreter before user code. It captures the
//! raw host functions, removes them from the global scope, and exposes the
//! ergonomic surface (`console`, `fetch`, `pkg`) on top of them. The host
//! drives the rest of the run through four entry points, each taking and
//! returning a single string:
//!
//! - `__init(inputJson)` installs the `input` global
//! - `__run(code)` evaluates user code and records its completion value
//! - `__settle(messageJson)` resolves or rejects a deferred host call
//! - `__finish()` reports the outcome as JSON

/// Entry points the session calls after bootstrap
pub const INIT: &str = "__init";
pub const RUN: &str = "__run";
pub const SETTLE: &str = "__settle";
pub const FINISH: &str = "__finish";

/// Global a guest may assign to override the completion value
pub const RESULT_GLOBAL: &str = "__result";

pub const BOOTSTRAP: &str = r#"
(() => {
  "use strict";
  const g = globalThis;
  const host = {
    log: g.__host_log,
    install: g.__host_pkg_install,
    list: g.__host_pkg_list,
    fetch: g.__host_fetch,
  };
  for (const name of ["__host_log", "__host_pkg_install", "__host_pkg_list", "__host_fetch"]) {
    delete g[name];
  }

  const pending = new Map();
  const unwrap = (text) => {
    const reply = JSON.parse(text);
    if (!reply.ok) throw new Error(reply.error);
    return reply;
  };
  const defer = (reply) =>
    new Promise((resolve, reject) => pending.set(reply.pending, { resolve, reject }));

  const show = (value) => {
    if (typeof value === "string") return value;
    if (value instanceof Error) return `${value.name}: ${value.message}`;
    try {
      const text = JSON.stringify(value);
      return text === undefined ? String(value) : text;
    } catch (_) {
      return String(value);
    }
  };
  const emit = (level) => (...args) => {
    unwrap(host.log(level, args.map(show).join(" ")));
  };
  g.console = {
    log: emit("log"),
    info: emit("log"),
    debug: emit("log"),
    warn: emit("warn"),
    error: emit("error"),
  };

  class Response {
    constructor(raw) {
      this.status = raw.status;
      this.ok = raw.ok;
      this.url = raw.finalUrl;
      this.headers = raw.headers;
      this.bodyText = raw.bodyText;
    }
    text() {
      return Promise.resolve(this.bodyText);
    }
    json() {
      return Promise.resolve(this.bodyText).then((text) => JSON.parse(text));
    }
  }
  g.Response = Response;

  g.fetch = (url, init) => {
    const reply = unwrap(host.fetch(String(url), JSON.stringify(init === undefined ? {} : init)));
    return defer(reply).then((raw) => new Response(raw));
  };

  const pkg = {
    install: (spec) => defer(unwrap(host.install(String(spec), ""))),
    list: () => unwrap(host.list("", "")).value,
    import: (spec) => pkg.install(spec).then(() => import("npm:" + String(spec).trim())),
  };
  g.pkg = Object.freeze(pkg);

  const describe = (error) =>
    error instanceof Error ? `${error.name}: ${error.message}` : show(error);
  const serialize = (value) => {
    try {
      const text = JSON.stringify(value);
      return text === undefined ? null : text;
    } catch (_) {
      return JSON.stringify(String(value));
    }
  };

  let outcome = { state: "pending" };
  const capture = (value) => {
    const thenable =
      value !== null &&
      (typeof value === "object" || typeof value === "function") &&
      typeof value.then === "function";
    if (!thenable) {
      outcome = { state: "fulfilled", value };
      return;
    }
    value.then(
      (settled) => { outcome = { state: "fulfilled", value: settled }; },
      (error) => { outcome = { state: "rejected", error: describe(error) }; },
    );
  };

  const internal = (name, fn) =>
    Object.defineProperty(g, name, { value: fn, writable: false, enumerable: false, configurable: false });

  internal("__init", (inputJson) => {
    g.input = JSON.parse(inputJson);
    return "";
  });
  internal("__run", (code) => {
    capture((0, eval)(code));
    return "";
  });
  internal("__settle", (messageJson) => {
    const message = JSON.parse(messageJson);
    const entry = pending.get(message.id);
    if (entry) {
      pending.delete(message.id);
      if (message.ok) entry.resolve(message.value);
      else entry.reject(new Error(message.error));
    }
    return "";
  });
  internal("__finish", () => {
    if (outcome.state !== "fulfilled") {
      return JSON.stringify(outcome);
    }
    const value = g.__result !== undefined ? g.__result : outcome.value;
    return JSON.stringify({ state: "fulfilled", json: serialize(value) });
  });
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HOST_FUNCTIONS;

    #[test]
    fn test_bootstrap_mentions_every_entry_point() {
        for name in [INIT, RUN, SETTLE, FINISH, RESULT_GLOBAL] {
            assert!(BOOTSTRAP.contains(name), "{name} missing from bootstrap");
        }
        for name in HOST_FUNCTIONS {
            assert!(BOOTSTRAP.contains(name), "{name} missing from bootstrap");
        }
    }
}
