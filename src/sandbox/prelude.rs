// Builtins installed into every boundary before any connector code runs

/// Evaluates to a factory taking the native bridge object.
///
/// The factory installs `console`, `setTimeout` and `clearTimeout` on the
/// global object and returns the helper table the boundary keeps privately:
///
/// - `dispatch(fn, base, requestId, methodPath, flags)` with `flags` holding
///   `fetch`, `logger` and `fields` booleans
/// - `describe(value)` wraps a non-callable resolved value
/// - `deliverFetch(id, response, error)` settles a pending proxied fetch
/// - `fireTimer(id)` runs a due timer callback
/// - `abandon(fetchIds, timerIds)` forgets work of a call nobody waits for
/// - `pendingWork()` counts pending fetches and timers
/// - `dataProperty(object, key)` reads an own data property as `{value}`,
///   or null for accessors, without running getters
///
/// Pending fetches and timer callbacks live in this closure, so no connector
/// code can reach them by name.
pub(crate) const PRELUDE: &str = r#"
(function (native) {
  "use strict";

  var pendingFetches = new Map();
  var timers = new Map();
  var getOwnPropertyDescriptor = Object.getOwnPropertyDescriptor;
  var hasOwn = Object.prototype.hasOwnProperty;

  function toArgs(list) {
    var out = [];
    for (var i = 0; i < list.length; i++) {
      var arg = list[i];
      out.push(arg instanceof Error ? String(arg) : arg);
    }
    return out;
  }

  function consoleMethod(level) {
    return function () {
      native.console(level, toArgs(arguments));
    };
  }

  globalThis.console = {
    log: consoleMethod("info"),
    info: consoleMethod("info"),
    debug: consoleMethod("debug"),
    warn: consoleMethod("warn"),
    error: consoleMethod("error")
  };

  globalThis.setTimeout = function (callback, delay) {
    if (typeof callback !== "function") {
      throw new TypeError("setTimeout callback must be a function");
    }
    var rest = Array.prototype.slice.call(arguments, 2);
    var id = native.schedule(Math.max(0, Number(delay) || 0));
    timers.set(id, function () {
      callback.apply(undefined, rest);
    });
    return id;
  };

  globalThis.clearTimeout = function (id) {
    if (timers.delete(id)) {
      native.cancel(id);
    }
  };

  function makeResponse(raw) {
    var text = typeof raw.text === "string" ? raw.text : "";
    return {
      ok: !!raw.ok,
      status: raw.status,
      statusText: raw.statusText || "",
      headers: raw.headers || {},
      text: function () {
        return Promise.resolve(text);
      },
      json: function () {
        return new Promise(function (resolve) {
          resolve(JSON.parse(text));
        });
      }
    };
  }

  function proxiedFetch(url, options) {
    return new Promise(function (resolve, reject) {
      var id = native.request(String(url), options === undefined ? null : options);
      pendingFetches.set(id, { resolve: resolve, reject: reject });
    });
  }

  function deniedFetch() {
    return Promise.reject(new Error("network capability not granted"));
  }

  function makeLogger(name, enabled) {
    function method(level) {
      return function () {
        if (enabled) {
          native.log(level, toArgs(arguments), name);
        }
      };
    }
    return {
      debug: method("debug"),
      info: method("info"),
      warn: method("warn"),
      error: method("error")
    };
  }

  async function resolveFields(fields, context) {
    if (!Array.isArray(fields)) {
      return fields;
    }
    var out = [];
    for (var i = 0; i < fields.length; i++) {
      var field = fields[i];
      if (field && typeof field === "object" && typeof field.pick_list === "function") {
        var resolved = Object.assign({}, field);
        resolved.pick_list = await field.pick_list(context);
        out.push(resolved);
      } else {
        out.push(field);
      }
    }
    return out;
  }

  async function invoke(fn, context, isFields) {
    var result = await fn(context);
    if (isFields) {
      result = await resolveFields(result, context);
    }
    return result;
  }

  return {
    dispatch: function (fn, base, requestId, methodPath, flags) {
      var context = base;
      context.fetch = flags.fetch ? proxiedFetch : deniedFetch;
      context.logger = makeLogger(methodPath, flags.logger);
      context.btoa = native.btoa;
      context.atob = native.atob;

      invoke(fn, context, flags.fields).then(
        function (result) {
          native.settle(requestId, result);
        },
        function (err) {
          var message = err && err.message !== undefined ? String(err.message) : undefined;
          var stack = err && err.stack ? String(err.stack) : undefined;
          native.fail(requestId, String(err), message, stack);
        }
      );
    },

    describe: function (value) {
      return {
        value: value,
        type: value === null ? "null" : typeof value,
        note: "Resolved value is not a function; returned without invoking it"
      };
    },

    deliverFetch: function (id, response, error) {
      var pending = pendingFetches.get(id);
      if (!pending) {
        return false;
      }
      pendingFetches.delete(id);
      if (error !== undefined && error !== null) {
        pending.reject(new Error(String(error)));
      } else {
        pending.resolve(makeResponse(response || {}));
      }
      return true;
    },

    fireTimer: function (id) {
      var callback = timers.get(id);
      if (!callback) {
        return;
      }
      timers.delete(id);
      try {
        callback();
      } catch (err) {
        native.console("error", [String(err)]);
      }
    },

    abandon: function (fetchIds, timerIds) {
      for (var i = 0; i < fetchIds.length; i++) {
        pendingFetches.delete(fetchIds[i]);
      }
      for (var j = 0; j < timerIds.length; j++) {
        timers.delete(timerIds[j]);
      }
    },

    pendingWork: function () {
      return pendingFetches.size + timers.size;
    },

    dataProperty: function (object, key) {
      var descriptor = getOwnPropertyDescriptor(object, key);
      if (!descriptor || !hasOwn.call(descriptor, "value")) {
        return null;
      }
      return { value: descriptor.value };
    }
  };
})
"#;
