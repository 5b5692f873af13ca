/****************** Protocol ****************/
mod discovery;
mod link_breaks;
mod properties;

/****************** Runtime *****************/
mod node_events;
