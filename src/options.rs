//! Typed optional arguments for the commands that take them.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Sync,
    Async,
}

impl FlushMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushMode::Sync => "SYNC",
            FlushMode::Async => "ASYNC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoSection {
    Server,
    Clients,
    Memory,
    Persistence,
    Stats,
    Replication,
    Cpu,
    Commandstats,
    Latencystats,
    Sentinel,
    Cluster,
    Modules,
    Keyspace,
    Errorstats,
    All,
    Default,
    Everything,
}

impl InfoSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfoSection::Server => "server",
            InfoSection::Clients => "clients",
            InfoSection::Memory => "memory",
            InfoSection::Persistence => "persistence",
            InfoSection::Stats => "stats",
            InfoSection::Replication => "replication",
            InfoSection::Cpu => "cpu",
            InfoSection::Commandstats => "commandstats",
            InfoSection::Latencystats => "latencystats",
            InfoSection::Sentinel => "sentinel",
            InfoSection::Cluster => "cluster",
            InfoSection::Modules => "modules",
            InfoSection::Keyspace => "keyspace",
            InfoSection::Errorstats => "errorstats",
            InfoSection::All => "all",
            InfoSection::Default => "default",
            InfoSection::Everything => "everything",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    String,
    List,
    Set,
    ZSet,
    Hash,
    Stream,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::String => "string",
            ObjectType::List => "list",
            ObjectType::Set => "set",
            ObjectType::ZSet => "zset",
            ObjectType::Hash => "hash",
            ObjectType::Stream => "stream",
        }
    }
}

/// `SCAN cursor [MATCH pattern] [COUNT count] [TYPE type]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub pattern: Option<String>,
    pub count: Option<u64>,
    pub object_type: Option<ObjectType>,
}

impl ScanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_match(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_type(mut self, object_type: ObjectType) -> Self {
        self.object_type = Some(object_type);
        self
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(pattern) = &self.pattern {
            args.push("MATCH".into());
            args.push(pattern.clone());
        }
        if let Some(count) = self.count {
            args.push("COUNT".into());
            args.push(count.to_string());
        }
        if let Some(object_type) = self.object_type {
            args.push("TYPE".into());
            args.push(object_type.as_str().into());
        }
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub offset: i64,
    pub count: i64,
}

/// `[BY pattern] [LIMIT offset count] [GET pattern ...] [ASC|DESC] [ALPHA]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortOptions {
    pub by_pattern: Option<String>,
    pub limit: Option<Limit>,
    pub get_patterns: Vec<String>,
    pub order: Option<OrderBy>,
    pub alpha: bool,
}

impl SortOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.by_pattern = Some(pattern.into());
        self
    }

    pub fn limit(mut self, offset: i64, count: i64) -> Self {
        self.limit = Some(Limit { offset, count });
        self
    }

    pub fn get_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.get_patterns.push(pattern.into());
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order = Some(order);
        self
    }

    pub fn alpha(mut self, alpha: bool) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(pattern) = &self.by_pattern {
            args.push("BY".into());
            args.push(pattern.clone());
        }
        if let Some(limit) = self.limit {
            args.push("LIMIT".into());
            args.push(limit.offset.to_string());
            args.push(limit.count.to_string());
        }
        for pattern in &self.get_patterns {
            args.push("GET".into());
            args.push(pattern.clone());
        }
        match self.order {
            Some(OrderBy::Asc) => args.push("ASC".into()),
            Some(OrderBy::Desc) => args.push("DESC".into()),
            None => {}
        }
        if self.alpha {
            args.push("ALPHA".into());
        }
        args
    }
}

/// `LOLWUT [VERSION version] [arg ...]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LolwutOptions {
    pub version: Option<i64>,
    pub args: Vec<i64>,
}

impl LolwutOptions {
    pub fn new(version: i64) -> Self {
        Self {
            version: Some(version),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<i64>) -> Self {
        self.args = args;
        self
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(version) = self.version {
            args.push("VERSION".into());
            args.push(version.to_string());
        }
        args.extend(self.args.iter().map(|arg| arg.to_string()));
        args
    }
}
