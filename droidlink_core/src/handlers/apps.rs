//! Installed-package operations

use super::{json_body, ApiError, HandlerResult};
use crate::http::{Request, Response};
use crate::providers::AppsProvider;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

pub struct AppsHandler {
    apps: Arc<dyn AppsProvider>,
}

#[derive(Deserialize)]
struct PackageBody {
    package: String,
}

impl AppsHandler {
    pub fn new(apps: Arc<dyn AppsProvider>) -> Self {
        Self { apps }
    }

    pub fn handle(&self, action: &str, param: Option<&str>, request: &Request) -> HandlerResult {
        match action {
            "list" => {
                let third_party_only = request.query_param("third_party") != Some("false");
                let apps = self.apps.list(!third_party_only)?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "count": apps.len(),
                    "apps": apps,
                })))
            }
            "info" => {
                let package = self.package_arg(param, request)?;
                let info = self.apps.info(&package)?;
                let source_dir = info.source_dir.clone();
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "app": info,
                    "source_dir": source_dir,
                })))
            }
            "apk" => {
                let package = self.package_arg(param, request)?;
                let info = self.apps.info(&package)?;
                if info.source_dir.is_empty() {
                    return Err(ApiError::NotFound("no APK path for package".to_string()));
                }
                Ok(
                    Response::file(PathBuf::from(info.source_dir), "application/vnd.android.package-archive")
                        .with_header(
                            "Content-Disposition",
                            &format!("attachment; filename=\"{}.apk\"", package),
                        ),
                )
            }
            "data-paths" => {
                let package = self.package_arg(param, request)?;
                let paths = self.apps.data_paths(&package)?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "package": package,
                    "paths": paths,
                })))
            }
            "install" => {
                if request.method != "POST" {
                    return Err(ApiError::BadRequest("install requires POST".to_string()));
                }

                // The APK arrives as the request body; spooled uploads
                // can be handed to the provider in place.
                let apk_path = match &request.body_file {
                    Some(spooled) => spooled.clone(),
                    None => {
                        if request.body.is_empty() {
                            return Err(ApiError::BadRequest("missing APK body".to_string()));
                        }
                        let tmp = std::env::temp_dir()
                            .join(format!("droidlink-install-{}.apk", crate::pairing::random_id()));
                        std::fs::write(&tmp, &request.body)?;
                        tmp
                    }
                };

                let result = self.apps.install(&apk_path);
                if request.body_file.is_none() {
                    let _ = std::fs::remove_file(&apk_path);
                }
                result?;

                Ok(Response::ok_json(serde_json::json!({ "status": "ok" })))
            }
            "uninstall" => {
                if request.method != "POST" {
                    return Err(ApiError::BadRequest("uninstall requires POST".to_string()));
                }
                let body: PackageBody = json_body(request)?;
                self.apps.uninstall(&body.package)?;
                Ok(Response::ok_json(serde_json::json!({
                    "status": "ok",
                    "package": body.package,
                })))
            }
            _ => Err(ApiError::NotFound(format!("unknown apps action '{}'", action))),
        }
    }

    fn package_arg(&self, param: Option<&str>, request: &Request) -> Result<String, ApiError> {
        param
            .map(|p| p.to_string())
            .or_else(|| request.query_param("package").map(|p| p.to_string()))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ApiError::BadRequest("missing parameter 'package'".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{AppDataPath, AppInfo, ProviderError, ProviderResult};
    use std::sync::Mutex;

    struct FakeApps {
        installed: Mutex<Vec<String>>,
    }

    impl FakeApps {
        fn new() -> Self {
            Self {
                installed: Mutex::new(vec!["com.example.maps".to_string()]),
            }
        }

        fn sample(package: &str) -> AppInfo {
            AppInfo {
                package: package.to_string(),
                label: "Maps".into(),
                version_name: "2.1".into(),
                version_code: 210,
                target_sdk: 34,
                source_dir: "/data/app/com.example.maps/base.apk".into(),
                split_dirs: vec![],
                system: false,
            }
        }
    }

    impl AppsProvider for FakeApps {
        fn list(&self, _include_system: bool) -> ProviderResult<Vec<AppInfo>> {
            Ok(self
                .installed
                .lock()
                .unwrap()
                .iter()
                .map(|p| Self::sample(p))
                .collect())
        }
        fn info(&self, package: &str) -> ProviderResult<AppInfo> {
            if self.installed.lock().unwrap().iter().any(|p| p == package) {
                Ok(Self::sample(package))
            } else {
                Err(ProviderError::NotFound(format!("unknown package {}", package)))
            }
        }
        fn data_paths(&self, package: &str) -> ProviderResult<Vec<AppDataPath>> {
            self.info(package)?;
            Ok(vec![AppDataPath {
                path: format!("/data/data/{}", package),
                bytes: 4096,
            }])
        }
        fn install(&self, _apk: &std::path::Path) -> ProviderResult<()> {
            self.installed.lock().unwrap().push("com.new.app".to_string());
            Ok(())
        }
        fn uninstall(&self, package: &str) -> ProviderResult<()> {
            let mut installed = self.installed.lock().unwrap();
            let before = installed.len();
            installed.retain(|p| p != package);
            if installed.len() == before {
                return Err(ProviderError::NotFound(format!("unknown package {}", package)));
            }
            Ok(())
        }
    }

    fn body_json(response: Response) -> serde_json::Value {
        match response.body {
            crate::http::Body::Bytes(bytes) => serde_json::from_slice(&bytes).unwrap(),
            _ => panic!("expected bytes body"),
        }
    }

    #[test]
    fn test_list() {
        let handler = AppsHandler::new(Arc::new(FakeApps::new()));
        let request = Request::test("GET", "/api/apps/list");
        let value = body_json(handler.handle("list", None, &request).unwrap());
        assert_eq!(value["count"], 1);
        assert_eq!(value["apps"][0]["package"], "com.example.maps");
    }

    #[test]
    fn test_info_by_positional_param() {
        let handler = AppsHandler::new(Arc::new(FakeApps::new()));
        let request = Request::test("GET", "/api/apps/info/com.example.maps");
        let value = body_json(
            handler
                .handle("info", Some("com.example.maps"), &request)
                .unwrap(),
        );
        assert_eq!(value["source_dir"], "/data/app/com.example.maps/base.apk");
    }

    #[test]
    fn test_unknown_package_is_404() {
        let handler = AppsHandler::new(Arc::new(FakeApps::new()));
        let request = Request::test("GET", "/api/apps/info?package=com.ghost");
        assert_eq!(
            handler.handle("info", None, &request).unwrap_err().status(),
            404
        );
    }

    #[test]
    fn test_uninstall_flow() {
        let fake = Arc::new(FakeApps::new());
        let handler = AppsHandler::new(Arc::clone(&fake) as Arc<dyn AppsProvider>);

        let mut request = Request::test("POST", "/api/apps/uninstall");
        request.body = br#"{"package": "com.example.maps"}"#.to_vec();
        handler.handle("uninstall", None, &request).unwrap();
        assert!(fake.installed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_install_requires_post_and_body() {
        let handler = AppsHandler::new(Arc::new(FakeApps::new()));

        let request = Request::test("GET", "/api/apps/install");
        assert_eq!(
            handler.handle("install", None, &request).unwrap_err().status(),
            400
        );

        let request = Request::test("POST", "/api/apps/install");
        assert_eq!(
            handler.handle("install", None, &request).unwrap_err().status(),
            400
        );
    }

    #[test]
    fn test_missing_package_is_400() {
        let handler = AppsHandler::new(Arc::new(FakeApps::new()));
        let request = Request::test("GET", "/api/apps/info");
        assert_eq!(
            handler.handle("info", None, &request).unwrap_err().status(),
            400
        );
    }
}
