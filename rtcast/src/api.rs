//! Public HTTP API, `/api/v1/*` plus the Prometheus exposition. Every
//! response carries the `{code, server, service, pid, ...}` envelope and
//! honors JSONP via `?callback=`.

use serde_json::{json, Value};
use std::rc::Rc;

use shared::error::{Error, Result};

use crate::config::AppConfig;
use crate::http::{api_response, api_response_err, HttpMessage, ResponseWriter};
use crate::stats::Statistic;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct ApiServer<C: AppConfig> {
    stat: Rc<Statistic>,
    config: Rc<C>,
}

impl<C: AppConfig> ApiServer<C> {
    pub fn new(stat: Rc<Statistic>, config: Rc<C>) -> Self {
        Self { stat, config }
    }

    fn envelope(&self) -> Value {
        json!({
            "code": 0,
            "server": self.stat.server_id,
            "service": self.stat.service_id,
            "pid": self.stat.service_pid,
        })
    }

    fn with(&self, key: &str, value: Value) -> Value {
        let mut v = self.envelope();
        v[key] = value;
        v
    }

    pub fn serve_http(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        let path = r.path.trim_end_matches('/');
        match path {
            "/api" | "/api/v1" => self.root(w, r),
            "/api/v1/versions" => self.versions(w, r),
            "/api/v1/summaries" => self.summaries(w, r),
            "/api/v1/authors" => self.authors(w, r),
            "/api/v1/features" => self.features(w, r),
            "/api/v1/rusages" => self.rusages(w, r),
            "/api/v1/self_proc_stats" => self.self_proc_stats(w, r),
            "/api/v1/system_proc_stats" => self.system_proc_stats(w, r),
            "/api/v1/meminfos" => self.meminfos(w, r),
            "/api/v1/requests" => self.requests(w, r),
            "/api/v1/vhosts" => self.vhosts(w, r),
            "/api/v1/streams" => self.streams(w, r),
            "/api/v1/clients" => self.clients(w, r, None),
            "/api/v1/clusters" => self.clusters(w, r),
            "/api/v1/raw" => self.raw(w, r),
            "/metrics" => self.metrics(w),
            p if p.starts_with("/api/v1/clients/") => {
                let id = p.trim_start_matches("/api/v1/clients/").to_string();
                self.clients(w, r, Some(id))
            }
            _ => api_response_err(w, r, Error::ErrStreamNotFound),
        }
    }

    fn root(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        let mut v = self.envelope();
        v["urls"] = json!({
            "versions": "the version of server",
            "summaries": "the summary of server",
            "rusages": "the rusage of server",
            "self_proc_stats": "the self process stats",
            "system_proc_stats": "the system process stats",
            "meminfos": "the memory info of system",
            "authors": "the license and authors",
            "features": "the features of server",
            "requests": "the request itself",
            "vhosts": "manage all vhosts",
            "streams": "manage all streams",
            "clients": "manage all clients",
            "clusters": "origin cluster server API",
            "raw": "raw api for server",
        });
        v["tests"] = json!({
            "requests": "show the request info",
            "errors": "always return an error 100",
            "redirects": "redirect request to the requests",
        });
        api_response(w, r, v)
    }

    fn versions(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        let mut parts = SERVER_VERSION.split(|c| c == '.' || c == '-');
        let major = parts.next().unwrap_or("0").to_string();
        let minor = parts.next().unwrap_or("0").to_string();
        let revision = parts.next().unwrap_or("0").to_string();
        api_response(
            w,
            r,
            self.with(
                "data",
                json!({
                    "major": major,
                    "minor": minor,
                    "revision": revision,
                    "version": SERVER_VERSION,
                }),
            ),
        )
    }

    fn summaries(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        api_response(
            w,
            r,
            self.with(
                "data",
                json!({
                    "ok": true,
                    "self": {
                        "version": SERVER_VERSION,
                        "pid": self.stat.service_pid,
                    },
                    "system": {
                        "connections": self.stat.nb_clients(),
                        "streams": self.stat.nb_streams(),
                    },
                }),
            ),
        )
    }

    fn authors(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        api_response(
            w,
            r,
            self.with(
                "data",
                json!({
                    "license": "MIT/Apache-2.0",
                    "contributors": "rtcast developers",
                }),
            ),
        )
    }

    fn features(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        api_response(
            w,
            r,
            self.with(
                "data",
                json!({
                    "rtc": true,
                    "gb28181": true,
                    "http_flv": true,
                    "http_ts": true,
                    "http_aac": true,
                    "http_mp3": true,
                }),
            ),
        )
    }

    // Resource sampling endpoints keep their field shapes; the host process
    // may substitute a real sampler.
    fn rusages(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        api_response(
            w,
            r,
            self.with(
                "data",
                json!({
                    "ok": true,
                    "ru_utime": 0,
                    "ru_stime": 0,
                    "ru_maxrss": 0,
                    "ru_minflt": 0,
                    "ru_majflt": 0,
                    "ru_nvcsw": 0,
                    "ru_nivcsw": 0,
                }),
            ),
        )
    }

    fn self_proc_stats(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        api_response(
            w,
            r,
            self.with(
                "data",
                json!({
                    "ok": true,
                    "pid": self.stat.service_pid,
                    "percent": 0.0,
                    "utime": 0,
                    "stime": 0,
                    "vsize": 0,
                    "rss": 0,
                }),
            ),
        )
    }

    fn system_proc_stats(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        api_response(
            w,
            r,
            self.with(
                "data",
                json!({
                    "ok": true,
                    "percent": 0.0,
                    "user": 0,
                    "nice": 0,
                    "sys": 0,
                    "idle": 0,
                }),
            ),
        )
    }

    fn meminfos(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        api_response(
            w,
            r,
            self.with(
                "data",
                json!({
                    "ok": true,
                    "percent_ram": 0.0,
                    "percent_swap": 0.0,
                    "MemTotal": 0,
                    "MemFree": 0,
                    "SwapTotal": 0,
                    "SwapFree": 0,
                }),
            ),
        )
    }

    fn requests(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        let mut v = self.envelope();
        v["data"] = json!({
            "uri": r.path,
            "method": r.method,
            "query": r.query.iter().map(|(k, v)| json!({k: v})).collect::<Vec<_>>(),
        });
        api_response(w, r, v)
    }

    fn vhosts(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        api_response(w, r, self.with("vhosts", self.stat.dumps_vhosts()))
    }

    fn streams(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        api_response(w, r, self.with("streams", self.stat.dumps_streams()))
    }

    fn clients(
        &self,
        w: &mut dyn ResponseWriter,
        r: &HttpMessage,
        id: Option<String>,
    ) -> Result<()> {
        match id {
            None => api_response(w, r, self.with("clients", self.stat.dumps_clients())),
            Some(id) => match self.stat.dumps_client(&id) {
                Some(client) => api_response(w, r, self.with("client", client)),
                None => api_response_err(w, r, Error::ErrStreamNotFound),
            },
        }
    }

    fn clusters(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        api_response(
            w,
            r,
            self.with("data", json!({"query": {"ip": "", "vhost": "", "stream": ""}})),
        )
    }

    /// Raw API over the subscribed config: `rpc=raw|reload|reload-fetch`.
    fn raw(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        if !self.config.get_raw_api() {
            return api_response_err(w, r, Error::ErrRawApiDisabled);
        }
        match r.query_get("rpc").as_str() {
            "raw" => {
                if !self.config.get_raw_api_allow_query() {
                    return api_response_err(w, r, Error::ErrRawApiDisabled);
                }
                api_response(
                    w,
                    r,
                    self.with(
                        "global",
                        json!({
                            "http_hooks": self.config.get_vhost_http_hooks_enabled("__defaultVhost__"),
                            "http_remux": self.config.get_vhost_http_remux_enabled("__defaultVhost__"),
                            "stream_caster_listen": self.config.get_stream_caster_listen(),
                        }),
                    ),
                )
            }
            "reload" => {
                if !self.config.get_raw_api_allow_reload() {
                    return api_response_err(w, r, Error::ErrRawApiDisabled);
                }
                api_response(w, r, self.envelope())
            }
            "reload-fetch" => api_response(
                w,
                r,
                self.with("data", json!({"err": 0, "msg": "", "state": 0, "rid": ""})),
            ),
            other => api_response_err(w, r, Error::ErrApiInvalidRpc(other.to_string())),
        }
    }

    /// Prometheus text exposition. Metric names and help strings are
    /// observable ABI.
    fn metrics(&self, w: &mut dyn ResponseWriter) -> Result<()> {
        let body = format!(
            concat!(
                "# HELP rtcast_build_info Build information.\n",
                "# TYPE rtcast_build_info gauge\n",
                "rtcast_build_info{{version=\"{version}\"}} 1\n",
                "# HELP rtcast_clients_total Number of connected clients.\n",
                "# TYPE rtcast_clients_total gauge\n",
                "rtcast_clients_total {clients}\n",
                "# HELP rtcast_streams_total Number of known streams.\n",
                "# TYPE rtcast_streams_total gauge\n",
                "rtcast_streams_total {streams}\n",
            ),
            version = SERVER_VERSION,
            clients = self.stat.nb_clients(),
            streams = self.stat.nb_streams(),
        );
        w.header().set_content_type("text/plain; version=0.0.4");
        w.write_header(200);
        w.write(body.as_bytes())?;
        w.final_request()
    }
}
