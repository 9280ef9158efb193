//! Incident markers: lifecycle, correlation, similar-incident search and
//! knowledge packs.

pub mod correlate;
pub mod knowledge;
pub mod lifecycle;
pub mod patterns;

pub use correlate::{
    Correlation, correlate_events, correlate_incident, correlate_window, incident_window,
};
pub use knowledge::{
    IncidentSignature, KnowledgePack, build_knowledge_pack, extract_symptoms,
    generate_knowledge_pack, render_incident_knowledge, slugify,
};
pub use lifecycle::{
    NewIncident, create_incident, list_incidents, parse_knowledge_pack, resolve_incident,
    show_incident, timeline_query_for,
};
pub use patterns::{
    PatternQuery, SimilarIncidents, find_similar, match_incidents, parse_services,
};
