//! URL query form of [`ConnectionParameters`], used to hand a complete
//! connection description to another component as one string.

use std::borrow::Cow;
use url::Url;

use super::parameters::{ConnectionParameters, DatabaseType};

/// Every query key owned by the connection parameters.
pub const URL_QUERY_KEYS: &[&str] = &[
    "databaseType",
    "databaseNameCore",
    "databaseNameThumbnails",
    "databaseNameFace",
    "databaseNameSimilarity",
    "connectOptions",
    "hostName",
    "port",
    "walMode",
    "internalServer",
    "internalServerPath",
    "internalServerInitCmd",
    "internalServerAdminCmd",
    "internalServerServerCmd",
    "internalServerUpgradeCmd",
    "userName",
    "password",
];

fn query_value<'a>(url: &'a Url, key: &str) -> Option<Cow<'a, str>> {
    url.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn query_string(url: &Url, key: &str) -> String {
    query_value(url, key).map(Cow::into_owned).unwrap_or_default()
}

fn query_bool(url: &Url, key: &str) -> bool {
    query_value(url, key).is_some_and(|v| v == "true")
}

impl ConnectionParameters {
    /// Parameters from the query of `url`. Missing keys leave fields empty.
    pub fn from_url(url: &Url) -> Self {
        let mut params = ConnectionParameters {
            database_type: query_value(url, "databaseType").and_then(|v| DatabaseType::from_str(&v)),
            database_name_core: query_string(url, "databaseNameCore"),
            database_name_thumbnails: query_string(url, "databaseNameThumbnails"),
            database_name_face: query_string(url, "databaseNameFace"),
            database_name_similarity: query_string(url, "databaseNameSimilarity"),
            connect_options: query_string(url, "connectOptions"),
            host_name: query_string(url, "hostName"),
            port: query_value(url, "port").and_then(|v| v.parse::<u16>().ok()),
            wal_mode: query_bool(url, "walMode"),
            internal_server: query_bool(url, "internalServer"),
            user_name: query_string(url, "userName"),
            password: query_string(url, "password"),
            ..ConnectionParameters::default()
        };

        if params.internal_server {
            params.internal_server_path = query_string(url, "internalServerPath");
            params.internal_server_init_cmd = query_string(url, "internalServerInitCmd");
            params.internal_server_admin_cmd = query_string(url, "internalServerAdminCmd");
            params.internal_server_server_cmd = query_string(url, "internalServerServerCmd");
            params.internal_server_upgrade_cmd = query_string(url, "internalServerUpgradeCmd");
        }

        params
    }

    /// Replace any connection keys in `url` with these parameters.
    pub fn insert_in_url(&self, url: &mut Url) {
        Self::remove_from_url(url);

        let mut pairs = url.query_pairs_mut();

        if let Some(database_type) = self.database_type {
            pairs.append_pair("databaseType", database_type.as_str());
        }

        for (key, value) in [
            ("databaseNameCore", &self.database_name_core),
            ("databaseNameThumbnails", &self.database_name_thumbnails),
            ("databaseNameFace", &self.database_name_face),
            ("databaseNameSimilarity", &self.database_name_similarity),
            ("connectOptions", &self.connect_options),
            ("hostName", &self.host_name),
        ] {
            if !value.is_empty() {
                pairs.append_pair(key, value);
            }
        }

        if let Some(port) = self.port {
            pairs.append_pair("port", &port.to_string());
        }

        if self.wal_mode {
            pairs.append_pair("walMode", "true");
        }

        if self.internal_server {
            pairs.append_pair("internalServer", "true");
            pairs.append_pair("internalServerPath", &self.internal_server_path);
            pairs.append_pair("internalServerInitCmd", &self.internal_server_init_cmd);
            pairs.append_pair("internalServerAdminCmd", &self.internal_server_admin_cmd);
            pairs.append_pair("internalServerServerCmd", &self.internal_server_server_cmd);
            pairs.append_pair("internalServerUpgradeCmd", &self.internal_server_upgrade_cmd);
        }

        if !self.user_name.is_empty() {
            pairs.append_pair("userName", &self.user_name);
        }

        if !self.password.is_empty() {
            pairs.append_pair("password", &self.password);
        }
    }

    /// Copy of `base` carrying these parameters.
    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        self.insert_in_url(&mut url);
        url
    }

    /// Strip all connection keys from `url`, keeping unrelated ones.
    pub fn remove_from_url(url: &mut Url) {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !URL_QUERY_KEYS.iter().any(|key| k == key))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        url.set_query(None);

        if !kept.is_empty() {
            url.query_pairs_mut().extend_pairs(kept);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EngineDefaults;
    use std::path::Path;

    fn base() -> Url {
        Url::parse("clepho:/catalog?view=albums").unwrap()
    }

    #[test]
    fn test_url_roundtrip_mysql() {
        let mut params = ConnectionParameters::defaults_with(
            DatabaseType::Mysql,
            &EngineDefaults::builtin(),
            true,
            false,
            Path::new("/srv/clepho data"),
        );
        params.password = "p&ss=word".to_string();

        let url = params.to_url(&base());
        assert_eq!(ConnectionParameters::from_url(&url), params);
    }

    #[test]
    fn test_url_roundtrip_sqlite() {
        let mut params = ConnectionParameters::for_sqlite("/photos/db/clepho.db");
        params.wal_mode = true;

        let url = params.to_url(&base());
        let parsed = ConnectionParameters::from_url(&url);
        assert_eq!(parsed, params);
        assert!(!url.as_str().contains("internalServerPath"));
    }

    #[test]
    fn test_internal_fields_ignored_when_off() {
        let url = Url::parse(
            "clepho:/catalog?databaseType=mysql&databaseNameCore=x&internalServerServerCmd=mysqld",
        )
        .unwrap();
        let params = ConnectionParameters::from_url(&url);
        assert!(!params.internal_server);
        assert!(params.internal_server_server_cmd.is_empty());
        assert_eq!(params.port, None);
    }

    #[test]
    fn test_insert_replaces_existing_keys() {
        let mut url = Url::parse("clepho:/catalog?view=albums&databaseNameCore=stale&port=1").unwrap();
        let params = ConnectionParameters::for_sqlite("/photos/clepho.db");
        params.insert_in_url(&mut url);

        let cores: Vec<_> = url
            .query_pairs()
            .filter(|(k, _)| k == "databaseNameCore")
            .collect();
        assert_eq!(cores.len(), 1);
        assert_eq!(cores[0].1, "/photos/clepho.db");
        assert!(!url.query_pairs().any(|(k, _)| k == "port"));
        assert!(url.query_pairs().any(|(k, v)| k == "view" && v == "albums"));
    }

    #[test]
    fn test_remove_from_url() {
        let params = ConnectionParameters::for_sqlite("/photos/clepho.db");
        let mut url = params.to_url(&base());
        ConnectionParameters::remove_from_url(&mut url);
        assert_eq!(url.query(), Some("view=albums"));

        let mut bare = Url::parse("clepho:/catalog?databaseType=sqlite").unwrap();
        ConnectionParameters::remove_from_url(&mut bare);
        assert_eq!(bare.query(), None);
    }
}
