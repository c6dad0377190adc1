//! The interior bootstrap program.
//!
//! Rendered once per container start and written into the IPC mount. The
//! program speaks the newline-delimited JSON protocol from [`crate::wire`]
//! on its real stdin/stdout, redirects user-visible stdout/stderr into
//! frames, and builds the `mcp.runtime` / `mcp.servers.*` helper modules
//! from metadata injected via `PYXIS_AVAILABLE_SERVERS` and
//! `PYXIS_DISCOVERED_SERVERS`.

/// Mount target of the per-invocation IPC directory inside the container.
pub const IPC_MOUNT_TARGET: &str = "/ipc";

/// Mount target of the persistent-state directory inside the container.
pub const PROJECTS_MOUNT_TARGET: &str = "/projects";

/// Filename of the bootstrap inside the IPC mount.
pub const BOOTSTRAP_FILENAME: &str = "entrypoint.py";

/// Produce the bootstrap program source.
#[must_use]
pub fn render_bootstrap() -> String {
    BOOTSTRAP.to_string()
}

const BOOTSTRAP: &str = r##"import asyncio
import inspect
import json
import os
import sys
import traceback
import types
from pathlib import Path

AVAILABLE_SERVERS = json.loads(os.environ.get("PYXIS_AVAILABLE_SERVERS", "[]"))
DISCOVERED_SERVERS = json.loads(os.environ.get("PYXIS_DISCOVERED_SERVERS", "{}"))
USER_TOOLS_PATH = Path("/projects/user_tools.py")
MEMORY_DIR = Path("/projects/memory")

_PENDING_RESPONSES = {}
_REQUEST_COUNTER = 0
_EXECUTION_QUEUE = asyncio.Queue()


def _send_message(message):
    sys.__stdout__.write(json.dumps(message, separators=(",", ":")) + "\n")
    sys.__stdout__.flush()


class _StreamProxy:
    def __init__(self, kind):
        self._kind = kind

    def write(self, data):
        if not data:
            return
        _send_message({"type": self._kind, "data": data})

    def flush(self):
        pass

    def isatty(self):
        return False


sys.stdout = _StreamProxy("stdout")
sys.stderr = _StreamProxy("stderr")


async def _stdin_reader():
    loop = asyncio.get_running_loop()
    reader = asyncio.StreamReader()
    protocol = asyncio.StreamReaderProtocol(reader)
    await loop.connect_read_pipe(lambda: protocol, sys.stdin)

    while True:
        line = await reader.readline()
        if not line:
            sys.exit(0)
        try:
            message = json.loads(line.decode())
        except Exception:
            continue

        msg_type = message.get("type")
        if msg_type == "rpc_response":
            request_id = message.get("id")
            future = _PENDING_RESPONSES.pop(request_id, None)
            if future and not future.done():
                if message.get("success", True):
                    future.set_result(message.get("payload"))
                else:
                    future.set_exception(RuntimeError(message.get("error", "RPC error")))
        elif msg_type == "execute":
            await _EXECUTION_QUEUE.put(message.get("code"))


async def _rpc_call(payload):
    loop = asyncio.get_running_loop()
    global _REQUEST_COUNTER
    _REQUEST_COUNTER += 1
    request_id = _REQUEST_COUNTER
    future = loop.create_future()
    _PENDING_RESPONSES[request_id] = future
    _send_message({"type": "rpc_request", "id": request_id, "payload": payload})
    return await future


def _install_mcp_modules():
    mcp_pkg = types.ModuleType("mcp")
    mcp_pkg.__path__ = []
    mcp_pkg.__all__ = ["runtime", "servers"]
    sys.modules["mcp"] = mcp_pkg

    runtime_module = types.ModuleType("mcp.runtime")
    servers_module = types.ModuleType("mcp.servers")
    servers_module.__path__ = []
    sys.modules["mcp.runtime"] = runtime_module
    sys.modules["mcp.servers"] = servers_module
    mcp_pkg.runtime = runtime_module
    mcp_pkg.servers = servers_module

    if USER_TOOLS_PATH.exists():
        try:
            import importlib.util
            spec = importlib.util.spec_from_file_location("user_tools", USER_TOOLS_PATH)
            if spec and spec.loader:
                user_tools = importlib.util.module_from_spec(spec)
                sys.modules["user_tools"] = user_tools
                spec.loader.exec_module(user_tools)
                for name, val in vars(user_tools).items():
                    if not name.startswith("_"):
                        globals()[name] = val
        except Exception:
            pass

    def save_tool(func):
        '''Save a function as a persistent tool available in future sessions.'''
        if not inspect.isfunction(func):
            raise ValueError("save_tool expects a function")

        source = inspect.getsource(func)
        USER_TOOLS_PATH.parent.mkdir(parents=True, exist_ok=True)

        with open(USER_TOOLS_PATH, "a") as f:
            f.write("\n\n")
            f.write(source)

        return f"Tool '{func.__name__}' saved. It will be available in future sessions."

    runtime_module.save_tool = save_tool
    globals()["save_tool"] = save_tool

    def _sanitize_memory_key(key):
        import re
        sanitized = re.sub(r'[^a-zA-Z0-9_-]', '_', str(key).strip())
        if not sanitized:
            raise ValueError("Memory key cannot be empty")
        if len(sanitized) > 100:
            sanitized = sanitized[:100]
        return sanitized

    def save_memory(key, value, *, metadata=None):
        '''Save JSON-serializable data under a key; created_at survives overwrites.'''
        import time
        sanitized_key = _sanitize_memory_key(key)
        MEMORY_DIR.mkdir(parents=True, exist_ok=True)

        memory_file = MEMORY_DIR / f"{sanitized_key}.json"
        memory_data = {
            "key": key,
            "value": value,
            "metadata": metadata or {},
            "created_at": time.time(),
            "updated_at": time.time(),
        }

        if memory_file.exists():
            try:
                existing = json.loads(memory_file.read_text())
                memory_data["created_at"] = existing.get("created_at", memory_data["created_at"])
            except Exception:
                pass

        memory_file.write_text(json.dumps(memory_data, indent=2, default=str))
        return f"Memory '{key}' saved."

    def load_memory(key, *, default=None):
        '''Load the value stored under a key, or default when absent.'''
        sanitized_key = _sanitize_memory_key(key)
        memory_file = MEMORY_DIR / f"{sanitized_key}.json"

        if not memory_file.exists():
            return default

        try:
            data = json.loads(memory_file.read_text())
            return data.get("value", default)
        except Exception:
            return default

    def delete_memory(key):
        '''Delete a memory entry.'''
        sanitized_key = _sanitize_memory_key(key)
        memory_file = MEMORY_DIR / f"{sanitized_key}.json"

        if memory_file.exists():
            memory_file.unlink()
            return f"Memory '{key}' deleted."
        return f"Memory '{key}' not found."

    def list_memories():
        '''List all saved memory keys with metadata and timestamps.'''
        if not MEMORY_DIR.exists():
            return []

        memories = []
        for memory_file in sorted(MEMORY_DIR.glob("*.json")):
            try:
                data = json.loads(memory_file.read_text())
                memories.append({
                    "key": data.get("key", memory_file.stem),
                    "metadata": data.get("metadata", {}),
                    "created_at": data.get("created_at"),
                    "updated_at": data.get("updated_at"),
                })
            except Exception:
                memories.append({"key": memory_file.stem, "error": "Failed to read"})
        return memories

    def update_memory(key, updater):
        '''Apply a function to the current value and store the result.'''
        current = load_memory(key, default=None)
        new_value = updater(current)
        save_memory(key, new_value)
        return new_value

    def memory_exists(key):
        '''Whether a memory key exists.'''
        sanitized_key = _sanitize_memory_key(key)
        return (MEMORY_DIR / f"{sanitized_key}.json").exists()

    def get_memory_info(key):
        '''Full memory record including metadata and timestamps, or None.'''
        sanitized_key = _sanitize_memory_key(key)
        memory_file = MEMORY_DIR / f"{sanitized_key}.json"

        if not memory_file.exists():
            return None

        try:
            return json.loads(memory_file.read_text())
        except Exception:
            return None

    runtime_module.save_memory = save_memory
    runtime_module.load_memory = load_memory
    runtime_module.delete_memory = delete_memory
    runtime_module.list_memories = list_memories
    runtime_module.update_memory = update_memory
    runtime_module.memory_exists = memory_exists
    runtime_module.get_memory_info = get_memory_info
    globals()["save_memory"] = save_memory
    globals()["load_memory"] = load_memory
    globals()["delete_memory"] = delete_memory
    globals()["list_memories"] = list_memories
    globals()["update_memory"] = update_memory
    globals()["memory_exists"] = memory_exists
    globals()["get_memory_info"] = get_memory_info

    class MCPError(RuntimeError):
        'Raised when an MCP call fails.'

    _CAPABILITY_SUMMARY = (
        "--- PYTHON SANDBOX MANUAL ---\n"
        "1. PHILOSOPHY: You are in a persistent Python environment. Prefer writing code over calling tools when possible.\n"
        "2. DISCOVERY: Use `runtime.discovered_servers()` to list servers. "
        "Use `runtime.discovered_servers(detailed=True)` for descriptions. "
        "Use `runtime.search_tool_docs('query')` to find tools. "
        "Don't guess tool names; search first.\n"
        "3. PERSISTENCE: Save custom tools with `save_tool(func)`. They persist across sessions.\n"
        "4. MEMORY: Store/retrieve data across sessions:\n"
        "   - `save_memory(key, value)` - Save any JSON-serializable data\n"
        "   - `load_memory(key, default=None)` - Retrieve saved data\n"
        "   - `list_memories()` - List all saved memories\n"
        "   - `update_memory(key, lambda x: ...)` - Update existing memory\n"
        "   - `delete_memory(key)` - Remove a memory\n"
        "5. HELPERS: `import mcp.runtime as runtime`. Available: list_servers(), list_tools_sync(server), "
        "query_tool_docs(server), describe_server(name).\n"
        "6. PROXIES: Loaded servers are available as `mcp_<alias>` (e.g. `await mcp_filesystem.read_file(...)`)."
    )

    _LOADED_SERVER_NAMES = tuple(server.get("name") for server in AVAILABLE_SERVERS)

    def _lookup_server(name):
        for server in AVAILABLE_SERVERS:
            if server.get("name") == name:
                return server
        raise MCPError(f"Server {name!r} is not loaded")

    def _normalise_detail(value):
        detail = str(value).lower() if value is not None else "summary"
        return detail if detail in {"summary", "full"} else "summary"

    def _format_tool_doc(server_info, tool_info, detail):
        doc = {
            "server": server_info.get("name"),
            "serverAlias": server_info.get("alias"),
            "tool": tool_info.get("name"),
            "toolAlias": tool_info.get("alias"),
        }
        description = tool_info.get("description")
        if description:
            doc["description"] = description
        if detail == "full" and tool_info.get("input_schema") is not None:
            doc["inputSchema"] = tool_info.get("input_schema")
        return doc

    async def call_tool(server, tool, arguments=None):
        response = await _rpc_call(
            {
                "type": "call_tool",
                "server": server,
                "tool": tool,
                "arguments": arguments or {},
            }
        )
        if not response.get("success", True):
            raise MCPError(response.get("error", "MCP request failed"))
        return response.get("result")

    async def list_tools(server):
        response = await _rpc_call({"type": "list_tools", "server": server})
        if not response.get("success", True):
            raise MCPError(response.get("error", "MCP request failed"))
        return response.get("tools", [])

    async def list_servers():
        response = await _rpc_call({"type": "list_servers"})
        if not response.get("success", True):
            raise MCPError(response.get("error", "MCP request failed"))
        return tuple(response.get("servers", ()))

    def list_servers_sync():
        return tuple(name for name in _LOADED_SERVER_NAMES if name)

    def discovered_servers(detailed=False):
        if detailed:
            return tuple({"name": k, "description": v} for k, v in DISCOVERED_SERVERS.items())
        return tuple(DISCOVERED_SERVERS.keys())

    def describe_server(name):
        return _lookup_server(name)

    def list_loaded_server_metadata():
        return tuple(AVAILABLE_SERVERS)

    def list_tools_sync(server=None):
        if server is None:
            raise MCPError("list_tools_sync(server) requires a server name")
        info = _lookup_server(server)
        tools = info.get("tools", ()) or ()
        return tuple(tools)

    async def query_tool_docs(server, tool=None, detail="summary"):
        payload = {"type": "query_tool_docs", "server": server}
        if tool is not None:
            payload["tool"] = tool
        if detail is not None:
            payload["detail"] = detail
        response = await _rpc_call(payload)
        if not response.get("success", True):
            raise MCPError(response.get("error", "MCP request failed"))
        docs = response.get("docs", [])
        if tool is not None and isinstance(docs, list) and len(docs) == 1:
            return docs[0]
        return docs

    async def search_tool_docs(query, *, limit=5, detail="summary"):
        payload = {"type": "search_tool_docs", "query": query}
        if limit is not None:
            payload["limit"] = limit
        if detail is not None:
            payload["detail"] = detail
        response = await _rpc_call(payload)
        if not response.get("success", True):
            raise MCPError(response.get("error", "MCP request failed"))
        return response.get("results", [])

    def query_tool_docs_sync(server, tool=None, detail="summary"):
        info = _lookup_server(server)
        detail_value = _normalise_detail(detail)
        tools = info.get("tools", ()) or ()
        if tool is None:
            return [_format_tool_doc(info, tool_info, detail_value) for tool_info in tools]

        if not isinstance(tool, str):
            raise MCPError("'tool' must be a string when provided")
        target = tool.lower()
        for candidate in tools:
            alias_value = str(candidate.get("alias", "")).lower()
            name_value = str(candidate.get("name", "")).lower()
            if target in {alias_value, name_value}:
                return [_format_tool_doc(info, candidate, detail_value)]
        raise MCPError(f"Tool {tool!r} not found for server {server}")

    def search_tool_docs_sync(query, *, limit=5, detail="summary"):
        tokens = [token for token in str(query).lower().split() if token]
        if not tokens:
            return []
        detail_value = _normalise_detail(detail)
        try:
            capped = max(1, min(20, int(limit)))
        except Exception:
            capped = 5
        matches = []
        for server_info in AVAILABLE_SERVERS:
            tools = server_info.get("tools", ()) or ()
            server_keywords = " ".join(
                filter(None, (server_info.get("name"), server_info.get("alias")))
            ).lower()
            for tool_info in tools:
                haystack = " ".join(
                    filter(
                        None,
                        (
                            server_keywords,
                            tool_info.get("name"),
                            tool_info.get("alias"),
                            tool_info.get("description"),
                        ),
                    )
                ).lower()
                if all(token in haystack for token in tokens):
                    matches.append(_format_tool_doc(server_info, tool_info, detail_value))
                    if len(matches) >= capped:
                        return matches
        return matches

    def capability_summary():
        return _CAPABILITY_SUMMARY

    runtime_module.MCPError = MCPError
    runtime_module.call_tool = call_tool
    runtime_module.list_tools = list_tools
    runtime_module.list_servers = list_servers
    runtime_module.list_servers_sync = list_servers_sync
    runtime_module.discovered_servers = discovered_servers
    runtime_module.describe_server = describe_server
    runtime_module.list_loaded_server_metadata = list_loaded_server_metadata
    runtime_module.list_tools_sync = list_tools_sync
    runtime_module.query_tool_docs = query_tool_docs
    runtime_module.search_tool_docs = search_tool_docs
    runtime_module.query_tool_docs_sync = query_tool_docs_sync
    runtime_module.search_tool_docs_sync = search_tool_docs_sync
    runtime_module.capability_summary = capability_summary
    runtime_module.__all__ = [
        "MCPError",
        "call_tool",
        "list_tools",
        "list_tools_sync",
        "list_servers",
        "list_servers_sync",
        "discovered_servers",
        "describe_server",
        "list_loaded_server_metadata",
        "query_tool_docs_sync",
        "query_tool_docs",
        "search_tool_docs_sync",
        "search_tool_docs",
        "capability_summary",
        "save_tool",
        "save_memory",
        "load_memory",
        "delete_memory",
        "list_memories",
        "update_memory",
        "memory_exists",
        "get_memory_info",
    ]

    servers_module.__all__ = []

    def _make_tool_callable(server_name, tool_name):
        async def _invoke(**kwargs):
            return await call_tool(server_name, tool_name, kwargs)

        return _invoke

    for server in AVAILABLE_SERVERS:
        alias = server["alias"]
        module_name = f"mcp.servers.{alias}"
        server_module = types.ModuleType(module_name)
        server_module.__doc__ = f"MCP server '{server['name']}' wrappers"
        server_module.__all__ = []
        tool_map = {}
        for tool in server.get("tools", []):
            tool_alias = tool["alias"]
            summary = (tool.get("description") or "").strip() or f"MCP tool {tool['name']} from {server['name']}"
            func = _make_tool_callable(server["name"], tool["name"])
            func.__name__ = tool_alias
            func.__doc__ = summary
            setattr(server_module, tool_alias, func)
            server_module.__all__.append(tool_alias)
            tool_map[tool_alias] = tool
        server_module.TOOLS = server.get("tools", [])
        server_module.TOOL_MAP = tool_map
        setattr(servers_module, alias, server_module)
        sys.modules[module_name] = server_module
        servers_module.__all__.append(alias)

    return runtime_module


runtime_module = _install_mcp_modules()
import mcp


class _MCPProxy:
    def __init__(self, server_info):
        self._server_name = server_info["name"]
        self._tools = {tool["alias"]: tool for tool in server_info.get("tools", [])}

    async def list_tools(self):
        response = await _rpc_call({"type": "list_tools", "server": self._server_name})
        if not response.get("success", True):
            raise RuntimeError(response.get("error", "MCP request failed"))
        return response.get("tools", [])

    def __getattr__(self, tool_alias):
        tool = self._tools.get(tool_alias)
        target = tool.get("name") if tool else tool_alias
        summary = (tool.get("description") if tool else "") or ""

        async def _invoke(_target=target, **kwargs):
            response = await _rpc_call(
                {
                    "type": "call_tool",
                    "server": self._server_name,
                    "tool": _target,
                    "arguments": kwargs,
                }
            )
            if not response.get("success", True):
                raise RuntimeError(response.get("error", "MCP call failed"))
            return response.get("result")

        if summary:
            _invoke.__doc__ = summary
        _invoke.__name__ = tool_alias
        return _invoke


_GLOBAL_NAMESPACE = {"__name__": "__sandbox__"}
_GLOBAL_NAMESPACE.setdefault("mcp", __import__("mcp"))
_GLOBAL_NAMESPACE["runtime"] = runtime_module
LOADED_MCP_SERVERS = tuple(server["name"] for server in AVAILABLE_SERVERS)
mcp_servers = {}
for server in AVAILABLE_SERVERS:
    proxy = _MCPProxy(server)
    mcp_servers[server["name"]] = proxy
    _GLOBAL_NAMESPACE[f"mcp_{server['alias']}"] = proxy

_GLOBAL_NAMESPACE.setdefault("mcp_servers", {}).update(mcp_servers)
_GLOBAL_NAMESPACE["LOADED_MCP_SERVERS"] = LOADED_MCP_SERVERS


async def _execute_code(code):
    try:
        flags = getattr(__import__("ast"), "PyCF_ALLOW_TOP_LEVEL_AWAIT", 0)
        compiled = compile(code, "<sandbox>", "exec", flags=flags)
        result = eval(compiled, _GLOBAL_NAMESPACE, _GLOBAL_NAMESPACE)
        if inspect.isawaitable(result):
            await result
    except SystemExit:
        raise
    except BaseException:
        traceback.print_exc()


async def _main_loop():
    asyncio.create_task(_stdin_reader())
    while True:
        code = await _EXECUTION_QUEUE.get()
        await _execute_code(code)
        _send_message({"type": "execution_done"})


if __name__ == "__main__":
    try:
        asyncio.run(_main_loop())
    except KeyboardInterrupt:
        pass
"##;
